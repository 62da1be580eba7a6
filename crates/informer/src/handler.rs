//! Change notifications and the handlers that consume them.

use std::sync::Arc;

use tokio::sync::mpsc;

/// One change delivered to a handler.
#[derive(Debug)]
pub enum Notification<K> {
    /// `initial` is set for objects replayed from the store or delivered by the
    /// first list.
    Add { obj: Arc<K>, initial: bool },
    /// Resyncs deliver the same object as `old` and `new`.
    Update { old: Arc<K>, new: Arc<K> },
    Delete(Arc<K>),
}

impl<K> Clone for Notification<K> {
    fn clone(&self) -> Self {
        match self {
            Notification::Add { obj, initial } => Notification::Add { obj: Arc::clone(obj), initial: *initial },
            Notification::Update { old, new } => Notification::Update { old: Arc::clone(old), new: Arc::clone(new) },
            Notification::Delete(obj) => Notification::Delete(Arc::clone(obj)),
        }
    }
}

impl<K> Notification<K> {
    pub fn object(&self) -> &Arc<K> {
        match self {
            Notification::Add { obj, .. } | Notification::Delete(obj) => obj,
            Notification::Update { new, .. } => new,
        }
    }

    pub fn is_resync(&self) -> bool {
        matches!(self, Notification::Update { old, new } if Arc::ptr_eq(old, new))
    }
}

/// Subscriber callbacks. Each registration runs on its own task, so a slow
/// handler only delays itself; callbacks should still return promptly.
pub trait EventHandler<K>: Send + Sync + 'static {
    fn on_add(&self, _obj: &Arc<K>, _initial: bool) {}
    fn on_update(&self, _old: &Arc<K>, _new: &Arc<K>) {}
    fn on_delete(&self, _obj: &Arc<K>) {}

    fn name(&self) -> String {
        "handler".to_string()
    }
}

type AddFn<K> = Box<dyn Fn(&Arc<K>, bool) + Send + Sync>;
type UpdateFn<K> = Box<dyn Fn(&Arc<K>, &Arc<K>) + Send + Sync>;
type DeleteFn<K> = Box<dyn Fn(&Arc<K>) + Send + Sync>;

/// Closure-backed handler; unset callbacks ignore their events.
pub struct HandlerFuncs<K> {
    name: String,
    add: Option<AddFn<K>>,
    update: Option<UpdateFn<K>>,
    delete: Option<DeleteFn<K>>,
}

impl<K> HandlerFuncs<K> {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), add: None, update: None, delete: None }
    }

    pub fn with_add(mut self, f: impl Fn(&Arc<K>, bool) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn with_update(mut self, f: impl Fn(&Arc<K>, &Arc<K>) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn with_delete(mut self, f: impl Fn(&Arc<K>) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<K: Send + Sync + 'static> EventHandler<K> for HandlerFuncs<K> {
    fn on_add(&self, obj: &Arc<K>, initial: bool) {
        if let Some(f) = &self.add {
            f(obj, initial)
        }
    }

    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) {
        if let Some(f) = &self.update {
            f(old, new)
        }
    }

    fn on_delete(&self, obj: &Arc<K>) {
        if let Some(f) = &self.delete {
            f(obj)
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Forwards every notification into an unbounded channel.
pub struct ChannelHandler<K> {
    name: String,
    tx: mpsc::UnboundedSender<Notification<K>>,
}

pub fn notification_channel<K>(name: impl Into<String>) -> (ChannelHandler<K>, mpsc::UnboundedReceiver<Notification<K>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelHandler { name: name.into(), tx }, rx)
}

impl<K: Send + Sync + 'static> EventHandler<K> for ChannelHandler<K> {
    fn on_add(&self, obj: &Arc<K>, initial: bool) {
        let _ = self.tx.send(Notification::Add { obj: Arc::clone(obj), initial });
    }

    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) {
        let _ = self.tx.send(Notification::Update { old: Arc::clone(old), new: Arc::clone(new) });
    }

    fn on_delete(&self, obj: &Arc<K>) {
        let _ = self.tx.send(Notification::Delete(Arc::clone(obj)));
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

pub(crate) fn dispatch<K>(handler: &dyn EventHandler<K>, n: &Notification<K>) {
    match n {
        Notification::Add { obj, initial } => handler.on_add(obj, *initial),
        Notification::Update { old, new } => handler.on_update(old, new),
        Notification::Delete(obj) => handler.on_delete(obj),
    }
}
