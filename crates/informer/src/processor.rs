//! Fan-out of store changes to per-handler queues.
//!
//! Store mutations and queue pushes happen under one dispatch lock, so a handler
//! registered mid-stream gets a replay that lines up exactly with the live
//! notifications that follow it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mirra_core::{Error, Object, Result};
use mirra_store::Store;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{OverflowPolicy, ShutdownPolicy};
use crate::handler::{dispatch, EventHandler, Notification};
use crate::reflector::ReflectorSink;

enum Message<K> {
    Notify(Notification<K>),
    /// Everything the handler needs for `has_synced` precedes this marker.
    Synced,
}

pub(crate) struct Listener<K> {
    id: Uuid,
    name: String,
    handler: Box<dyn EventHandler<K>>,
    queue: Mutex<VecDeque<Message<K>>>,
    capacity: usize,
    policy: OverflowPolicy,
    items: Notify,
    space: Notify,
    closed: AtomicBool,
    discard: AtomicBool,
    synced: AtomicBool,
    dropped: AtomicU64,
}

impl<K: Object> Listener<K> {
    fn new(handler: Box<dyn EventHandler<K>>, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: handler.name(),
            handler,
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            policy,
            items: Notify::new(),
            space: Notify::new(),
            closed: AtomicBool::new(false),
            discard: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Enqueue without applying the bound (store replays, sync markers).
    fn push_unbounded(&self, msg: Message<K>) {
        self.queue.lock().push_back(msg);
        self.items.notify_one();
    }

    async fn push(&self, n: Notification<K>) -> Result<()> {
        let mut msg = Some(Message::Notify(n));
        loop {
            {
                let mut q = self.queue.lock();
                if q.len() < self.capacity {
                    if let Some(m) = msg.take() {
                        q.push_back(m);
                    }
                    let depth = q.len();
                    drop(q);
                    self.items.notify_one();
                    metrics::gauge!("mirra_handler_queue_depth", depth as f64, "handler" => self.name.clone());
                    return Ok(());
                }
                match self.policy {
                    OverflowPolicy::Fail => {
                        return Err(Error::QueueOverflow { handler: self.name.clone(), capacity: self.capacity });
                    }
                    OverflowPolicy::DropOldest => {
                        // keep sync markers; they carry no payload
                        let evicted = match q.iter().position(|m| matches!(m, Message::Notify(_))) {
                            Some(pos) => q.remove(pos).is_some(),
                            None => false,
                        };
                        if let Some(m) = msg.take() {
                            q.push_back(m);
                        }
                        drop(q);
                        self.items.notify_one();
                        if evicted {
                            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            metrics::counter!("mirra_handler_dropped_total", 1, "handler" => self.name.clone());
                            if total.is_power_of_two() {
                                warn!(handler = %self.name, dropped = total, capacity = self.capacity, "handler queue full; dropping oldest");
                            }
                        }
                        return Ok(());
                    }
                    OverflowPolicy::Block => {}
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            self.space.notified().await;
        }
    }

    fn close(&self, policy: ShutdownPolicy) {
        if policy == ShutdownPolicy::Discard {
            self.discard.store(true, Ordering::Release);
        }
        self.closed.store(true, Ordering::Release);
        self.items.notify_one();
        self.space.notify_one();
    }

    async fn run(self: Arc<Self>) {
        debug!(handler = %self.name, id = %self.id, "handler loop started");
        loop {
            let next = {
                let mut q = self.queue.lock();
                if self.discard.load(Ordering::Acquire) {
                    let discarded = q.len();
                    q.clear();
                    if discarded > 0 {
                        debug!(handler = %self.name, discarded, "discarding pending notifications");
                    }
                    break;
                }
                q.pop_front()
            };
            match next {
                Some(Message::Notify(n)) => {
                    self.space.notify_one();
                    dispatch(self.handler.as_ref(), &n);
                }
                Some(Message::Synced) => self.synced.store(true, Ordering::Release),
                None if self.closed.load(Ordering::Acquire) => break,
                None => self.items.notified().await,
            }
        }
        self.space.notify_one();
        debug!(handler = %self.name, id = %self.id, "handler loop finished");
    }
}

struct Listeners<K> {
    entries: Vec<Arc<Listener<K>>>,
    tasks: Vec<JoinHandle<()>>,
    running: bool,
    stopped: bool,
}

/// Store owner plus handler fan-out; the informer's reflector sink.
pub(crate) struct Processor<K> {
    name: String,
    store: Store<K>,
    dispatch: tokio::sync::Mutex<()>,
    listeners: Mutex<Listeners<K>>,
    store_synced: AtomicBool,
    queue_capacity: usize,
    policy: OverflowPolicy,
}

impl<K: Object> Processor<K> {
    pub(crate) fn new(name: String, store: Store<K>, queue_capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            name,
            store,
            dispatch: tokio::sync::Mutex::new(()),
            listeners: Mutex::new(Listeners { entries: Vec::new(), tasks: Vec::new(), running: false, stopped: false }),
            store_synced: AtomicBool::new(false),
            queue_capacity,
            policy,
        }
    }

    pub(crate) fn store(&self) -> &Store<K> {
        &self.store
    }

    /// Initial list applied and every handler has consumed its part of it.
    pub(crate) fn has_synced(&self) -> bool {
        self.store_synced.load(Ordering::Acquire) && self.listeners.lock().entries.iter().all(|l| l.has_synced())
    }

    pub(crate) fn store_synced(&self) -> bool {
        self.store_synced.load(Ordering::Acquire)
    }

    pub(crate) async fn add_listener(
        &self,
        handler: Box<dyn EventHandler<K>>,
        capacity: Option<usize>,
    ) -> Result<Arc<Listener<K>>> {
        let _guard = self.dispatch.lock().await;
        let listener = Arc::new(Listener::new(handler, capacity.unwrap_or(self.queue_capacity), self.policy));
        let replay = self.store.list();
        let replayed = replay.len();
        for obj in replay {
            listener.push_unbounded(Message::Notify(Notification::Add { obj, initial: true }));
        }
        if self.store_synced() {
            listener.push_unbounded(Message::Synced);
        }
        {
            let mut ls = self.listeners.lock();
            if ls.stopped {
                return Err(Error::Stopped);
            }
            if ls.running {
                ls.tasks.push(tokio::spawn(Arc::clone(&listener).run()));
            }
            ls.entries.push(Arc::clone(&listener));
        }
        info!(kind = %self.name, handler = %listener.name(), replayed, "event handler registered");
        Ok(listener)
    }

    pub(crate) async fn remove_listener(&self, id: Uuid, policy: ShutdownPolicy) -> bool {
        let _guard = self.dispatch.lock().await;
        let removed = {
            let mut ls = self.listeners.lock();
            let pos = ls.entries.iter().position(|l| l.id() == id);
            pos.map(|p| ls.entries.remove(p))
        };
        match removed {
            Some(l) => {
                l.close(policy);
                info!(kind = %self.name, handler = %l.name(), "event handler removed");
                true
            }
            None => false,
        }
    }

    /// Spawn handler loops for everything registered so far.
    pub(crate) fn start(&self) {
        let mut ls = self.listeners.lock();
        if ls.running || ls.stopped {
            return;
        }
        ls.running = true;
        let tasks: Vec<JoinHandle<()>> = ls.entries.iter().map(|l| tokio::spawn(Arc::clone(l).run())).collect();
        ls.tasks.extend(tasks);
    }

    /// Close every queue per `policy` and wait for the handler loops to end.
    pub(crate) async fn shutdown(&self, policy: ShutdownPolicy) {
        let tasks = {
            let mut ls = self.listeners.lock();
            ls.stopped = true;
            for l in ls.entries.iter() {
                l.close(policy);
            }
            std::mem::take(&mut ls.tasks)
        };
        for t in tasks {
            if let Err(e) = t.await {
                warn!(kind = %self.name, error = %e, "handler loop panicked");
            }
        }
    }

    fn targets(&self) -> Vec<Arc<Listener<K>>> {
        self.listeners.lock().entries.clone()
    }

    /// Bounded delivery for list diffs, watch events and resyncs.
    async fn distribute(&self, notes: Vec<Notification<K>>) -> Result<()> {
        if notes.is_empty() {
            return Ok(());
        }
        for l in self.targets() {
            for n in notes.iter() {
                l.push(n.clone()).await?;
            }
        }
        Ok(())
    }

    /// The first list reaches early handlers the way a replay reaches late ones.
    fn distribute_initial(&self, notes: Vec<Notification<K>>) {
        for l in self.targets() {
            for n in notes.iter() {
                l.push_unbounded(Message::Notify(n.clone()));
            }
        }
    }
}

#[async_trait::async_trait]
impl<K: Object> ReflectorSink<K> for Processor<K> {
    async fn replace(&self, items: Vec<K>, resource_version: &str) -> Result<()> {
        let _guard = self.dispatch.lock().await;
        let first = !self.store_synced();
        let diff = self.store.replace(items);
        let mut notes = Vec::with_capacity(diff.added.len() + diff.updated.len() + diff.deleted.len());
        notes.extend(diff.deleted.into_iter().map(Notification::Delete));
        notes.extend(diff.updated.into_iter().map(|(old, new)| Notification::Update { old, new }));
        notes.extend(diff.added.into_iter().map(|obj| Notification::Add { obj, initial: first }));
        debug!(kind = %self.name, rv = resource_version, notifications = notes.len(), "distributing list");
        if first {
            self.distribute_initial(notes);
            self.store_synced.store(true, Ordering::Release);
            for l in self.targets() {
                l.push_unbounded(Message::Synced);
            }
            info!(kind = %self.name, objects = self.store.len(), "store synced");
        } else {
            self.distribute(notes).await?;
        }
        metrics::gauge!("mirra_store_objects", self.store.len() as f64, "kind" => self.name.clone());
        Ok(())
    }

    async fn upsert(&self, obj: K) -> Result<()> {
        let _guard = self.dispatch.lock().await;
        let up = self.store.add(obj)?;
        let note = match up.old {
            Some(old) => Notification::Update { old, new: up.new },
            None => Notification::Add { obj: up.new, initial: false },
        };
        self.distribute(vec![note]).await?;
        metrics::gauge!("mirra_store_objects", self.store.len() as f64, "kind" => self.name.clone());
        Ok(())
    }

    async fn delete(&self, obj: K) -> Result<()> {
        let _guard = self.dispatch.lock().await;
        if self.store.delete_object(&obj)?.is_none() {
            debug!(kind = %self.name, "delete for unknown object ignored");
            return Ok(());
        }
        self.distribute(vec![Notification::Delete(Arc::new(obj))]).await?;
        metrics::gauge!("mirra_store_objects", self.store.len() as f64, "kind" => self.name.clone());
        Ok(())
    }

    async fn resync(&self) -> Result<()> {
        let _guard = self.dispatch.lock().await;
        let notes: Vec<Notification<K>> = self
            .store
            .list()
            .into_iter()
            .map(|o| Notification::Update { old: Arc::clone(&o), new: o })
            .collect();
        metrics::counter!("mirra_resyncs_total", 1, "kind" => self.name.clone());
        self.distribute(notes).await
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use mirra_store::namespace_indexers;

    use super::*;
    use crate::handler::HandlerFuncs;

    fn cm(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn batch(prefix: &str, count: usize) -> Vec<ConfigMap> {
        (0..count).map(|i| cm(&format!("{}{}", prefix, i))).collect()
    }

    fn add() -> Notification<ConfigMap> {
        Notification::Add { obj: Arc::new(cm("x")), initial: false }
    }

    #[tokio::test]
    async fn drop_oldest_only_counts_evicted_notifications() {
        let l: Listener<ConfigMap> = Listener::new(Box::new(HandlerFuncs::new("idle")), 1, OverflowPolicy::DropOldest);
        l.push_unbounded(Message::Synced);
        l.push(add()).await.unwrap();
        assert_eq!(l.dropped(), 0, "a lone sync marker is never evicted");
        assert_eq!(l.pending(), 2);

        l.push(add()).await.unwrap();
        assert_eq!(l.dropped(), 1);
        assert_eq!(l.pending(), 2);
    }

    #[tokio::test]
    async fn first_list_ignores_queue_bound() {
        let p = Processor::new("configmaps".into(), Store::new(namespace_indexers()), 4, OverflowPolicy::Fail);
        let l = p.add_listener(Box::new(HandlerFuncs::new("early")), None).await.unwrap();

        ReflectorSink::replace(&p, batch("a", 50), "10").await.unwrap();
        assert_eq!(l.pending(), 51, "every add plus the sync marker");
        assert!(p.store_synced());

        // later lists are bounded like any other change
        let err = ReflectorSink::replace(&p, batch("b", 10), "20").await.unwrap_err();
        assert!(matches!(err, Error::QueueOverflow { capacity: 4, .. }), "got {:?}", err);
    }
}
