//! One reflector + store shared by any number of event handlers.

use std::sync::Arc;

use mirra_core::{noop_tweak, Error, ListWatch, Object, Result, TweakListOptions};
use mirra_store::{Indexers, Lister, Store, StoreReader};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::InformerConfig;
use crate::handler::EventHandler;
use crate::processor::{Listener, Processor};
use crate::reflector::{Reflector, ReflectorPhase, ReflectorState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Handle returned by [`SharedInformer::add_event_handler`].
pub struct Registration<K> {
    listener: Arc<Listener<K>>,
}

impl<K: Object> Registration<K> {
    pub fn id(&self) -> Uuid {
        self.listener.id()
    }

    pub fn name(&self) -> &str {
        self.listener.name()
    }

    /// The handler has processed the initial list (or its replay).
    pub fn has_synced(&self) -> bool {
        self.listener.has_synced()
    }

    /// Notifications discarded under `OverflowPolicy::DropOldest`.
    pub fn dropped(&self) -> u64 {
        self.listener.dropped()
    }

    pub fn pending(&self) -> usize {
        self.listener.pending()
    }
}

pub struct SharedInformer<K: Object> {
    name: String,
    list_watch: Arc<dyn ListWatch<K>>,
    config: InformerConfig,
    tweak: TweakListOptions,
    processor: Arc<Processor<K>>,
    state: Arc<ReflectorState>,
    lifecycle: Mutex<Lifecycle>,
}

impl<K: Object> SharedInformer<K> {
    /// Prefer [`crate::SharedInformerFactory`] so consumers share one instance per kind.
    pub fn new(list_watch: Arc<dyn ListWatch<K>>, config: InformerConfig, indexers: Indexers<K>) -> Self {
        Self::with_tweak_list_options(list_watch, config, indexers, noop_tweak())
    }

    /// Like [`SharedInformer::new`], with `tweak` applied to every list and watch call.
    pub fn with_tweak_list_options(
        list_watch: Arc<dyn ListWatch<K>>,
        config: InformerConfig,
        indexers: Indexers<K>,
        tweak: TweakListOptions,
    ) -> Self {
        let name = list_watch.describe();
        let store = Store::new(indexers);
        let processor = Arc::new(Processor::new(name.clone(), store, config.queue_capacity, config.overflow_policy));
        Self {
            name,
            list_watch,
            config,
            tweak,
            processor,
            state: Arc::new(ReflectorState::default()),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &InformerConfig {
        &self.config
    }

    /// Register a handler; it first receives every stored object as an initial add.
    pub async fn add_event_handler(&self, handler: impl EventHandler<K>) -> Result<Registration<K>> {
        self.add_handler(Box::new(handler), None).await
    }

    pub async fn add_event_handler_with_capacity(
        &self,
        handler: impl EventHandler<K>,
        capacity: usize,
    ) -> Result<Registration<K>> {
        self.add_handler(Box::new(handler), Some(capacity)).await
    }

    async fn add_handler(&self, handler: Box<dyn EventHandler<K>>, capacity: Option<usize>) -> Result<Registration<K>> {
        if self.is_stopped() {
            return Err(Error::Stopped);
        }
        let listener = self.processor.add_listener(handler, capacity).await?;
        Ok(Registration { listener })
    }

    /// Stop delivering to `registration`; `false` if it was not registered.
    pub async fn remove_event_handler(&self, registration: &Registration<K>) -> bool {
        self.processor.remove_listener(registration.id(), self.config.shutdown_policy).await
    }

    /// Only allowed before the informer starts.
    pub fn add_indexers(&self, indexers: Indexers<K>) -> Result<()> {
        if *self.lifecycle.lock() != Lifecycle::Idle {
            return Err(Error::IndexersAfterStart);
        }
        self.processor.store().add_indexers(indexers)
    }

    /// Run the reflector and handler loops until `stop` fires.
    ///
    /// Returns `Err(QueueOverflow)` if a handler overflowed under
    /// `OverflowPolicy::Fail`. A stopped informer cannot be run again.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        {
            let mut lc = self.lifecycle.lock();
            match *lc {
                Lifecycle::Idle => *lc = Lifecycle::Running,
                Lifecycle::Running => return Err(Error::AlreadyStarted),
                Lifecycle::Stopped => return Err(Error::Stopped),
            }
        }
        info!(kind = %self.name, "informer starting");
        self.processor.start();

        let reflector = Reflector::new(
            Arc::clone(&self.list_watch),
            Arc::clone(&self.processor),
            &self.config,
            Arc::clone(&self.tweak),
        )
        .with_state(Arc::clone(&self.state));
        let outcome = reflector.run(stop.child_token()).await;
        if let Err(e) = &outcome {
            error!(kind = %self.name, error = %e, "informer terminated");
        }

        *self.lifecycle.lock() = Lifecycle::Stopped;
        self.processor.shutdown(self.config.shutdown_policy).await;
        info!(kind = %self.name, "informer stopped");
        outcome
    }

    /// Initial list applied and delivered to every registered handler.
    pub fn has_synced(&self) -> bool {
        self.processor.has_synced()
    }

    /// Poll until synced; `false` if `stop` fires or the informer stops unsynced.
    pub async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> bool {
        loop {
            if self.has_synced() {
                return true;
            }
            if self.is_stopped() {
                return false;
            }
            tokio::select! {
                _ = stop.cancelled() => return self.has_synced(),
                _ = tokio::time::sleep(self.config.sync_poll_interval) => {}
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.lifecycle.lock() == Lifecycle::Stopped
    }

    pub fn phase(&self) -> ReflectorPhase {
        self.state.phase()
    }

    /// Resource version of the last list or watch event applied.
    pub fn last_sync_resource_version(&self) -> String {
        self.state.resource_version()
    }

    /// Read-only view of the store's index.
    pub fn indexer(&self) -> StoreReader<K> {
        self.processor.store().reader()
    }

    pub fn lister(&self) -> Lister<K> {
        Lister::new(self.indexer())
    }
}
