//! Registry handing out one shared informer per resource type.
//!
//! The factory is an explicit object with a bounded lifecycle: create it at
//! startup, pass it to whoever needs informers, `start` it, and `shutdown` it
//! on the way out.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use mirra_core::{noop_tweak, ListOptions, ListWatch, Object, Result, TweakListOptions};
use mirra_store::{namespace_indexers, Lister};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::InformerConfig;
use crate::shared::SharedInformer;

/// Type-erased view used to start, sync and stop informers of any kind.
trait ManagedInformer: Send + Sync {
    fn name(&self) -> String;
    fn has_synced(&self) -> bool;
    fn run(self: Arc<Self>, stop: CancellationToken) -> BoxFuture<'static, Result<()>>;
    fn wait_for_cache_sync<'a>(&'a self, stop: &'a CancellationToken) -> BoxFuture<'a, bool>;
}

impl<K: Object> ManagedInformer for SharedInformer<K> {
    fn name(&self) -> String {
        SharedInformer::name(self).to_string()
    }

    fn has_synced(&self) -> bool {
        SharedInformer::has_synced(self)
    }

    fn run(self: Arc<Self>, stop: CancellationToken) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { SharedInformer::run(&self, stop).await })
    }

    fn wait_for_cache_sync<'a>(&'a self, stop: &'a CancellationToken) -> BoxFuture<'a, bool> {
        Box::pin(SharedInformer::wait_for_cache_sync(self, stop))
    }
}

struct Entry {
    informer: Arc<dyn Any + Send + Sync>,
    managed: Arc<dyn ManagedInformer>,
    started: bool,
}

pub struct SharedInformerFactory {
    config: InformerConfig,
    namespace: Option<String>,
    tweak: TweakListOptions,
    custom_resync: HashMap<TypeId, Duration>,
    informers: Mutex<HashMap<TypeId, Entry>>,
    tasks: Mutex<Vec<(String, JoinHandle<Result<()>>)>>,
    stop: CancellationToken,
    shutting_down: AtomicBool,
}

impl SharedInformerFactory {
    pub fn new(config: InformerConfig) -> Self {
        Self {
            config,
            namespace: None,
            tweak: noop_tweak(),
            custom_resync: HashMap::new(),
            informers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            stop: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Limit informers built through this factory to one namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into()).filter(|ns: &String| !ns.is_empty());
        self
    }

    pub fn with_tweak_list_options(mut self, tweak: TweakListOptions) -> Self {
        self.tweak = tweak;
        self
    }

    /// Override the resync period for informers of type `K`.
    pub fn with_custom_resync<K: Object>(mut self, period: Duration) -> Self {
        self.custom_resync.insert(TypeId::of::<K>(), period);
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn tweak_list_options(&self) -> TweakListOptions {
        Arc::clone(&self.tweak)
    }

    /// Configuration an informer of type `K` should be built with.
    pub fn config_for<K: Object>(&self) -> InformerConfig {
        let mut cfg = self.config.clone();
        if let Some(period) = self.custom_resync.get(&TypeId::of::<K>()) {
            cfg.resync_period = *period;
        }
        cfg
    }

    /// Return the shared informer for `K`, building it with `build` on first request.
    pub fn informer_for<K, F>(&self, build: F) -> Arc<SharedInformer<K>>
    where
        K: Object,
        F: FnOnce(InformerConfig) -> SharedInformer<K>,
    {
        let mut informers = self.informers.lock();
        if let Some(entry) = informers.get(&TypeId::of::<K>()) {
            if let Ok(existing) = Arc::clone(&entry.informer).downcast::<SharedInformer<K>>() {
                return existing;
            }
        }
        let informer = Arc::new(build(self.config_for::<K>()));
        debug!(kind = %informer.name(), "informer registered with factory");
        informers.insert(
            TypeId::of::<K>(),
            Entry {
                informer: Arc::clone(&informer) as Arc<dyn Any + Send + Sync>,
                managed: Arc::clone(&informer) as Arc<dyn ManagedInformer>,
                started: false,
            },
        );
        informer
    }

    /// Spawn every informer not started yet. No-op after `shutdown`.
    pub fn start(&self) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let mut informers = self.informers.lock();
        let mut tasks = self.tasks.lock();
        for entry in informers.values_mut().filter(|e| !e.started) {
            entry.started = true;
            let name = entry.managed.name();
            info!(kind = %name, "factory starting informer");
            let fut = Arc::clone(&entry.managed).run(self.stop.child_token());
            tasks.push((name, tokio::spawn(fut)));
        }
    }

    /// Wait for every started informer; returns `(kind, synced)` pairs.
    pub async fn wait_for_cache_sync(&self) -> Vec<(String, bool)> {
        let started: Vec<Arc<dyn ManagedInformer>> =
            self.informers.lock().values().filter(|e| e.started).map(|e| Arc::clone(&e.managed)).collect();
        let mut out = Vec::with_capacity(started.len());
        for informer in started {
            let synced = informer.wait_for_cache_sync(&self.stop).await;
            out.push((informer.name(), synced));
        }
        out
    }

    /// Started informers that have completed their initial sync.
    pub fn synced(&self) -> Vec<(String, bool)> {
        self.informers.lock().values().filter(|e| e.started).map(|e| (e.managed.name(), e.managed.has_synced())).collect()
    }

    /// Stop every informer and wait for them to finish. Irreversible.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.stop.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, task) in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(kind = %name, error = %e, "informer ended with error"),
                Err(e) => warn!(kind = %name, error = %e, "informer task panicked"),
            }
        }
        info!("informer factory shut down");
    }
}

/// Per-kind access point: the generic replacement for generated informer glue.
pub struct TypedInformer<K: Object> {
    factory: Arc<SharedInformerFactory>,
    list_watch: Arc<dyn ListWatch<K>>,
    tweak: TweakListOptions,
}

impl<K: Object> TypedInformer<K> {
    pub fn new(factory: Arc<SharedInformerFactory>, list_watch: Arc<dyn ListWatch<K>>) -> Self {
        let tweak = factory.tweak_list_options();
        Self { factory, list_watch, tweak }
    }

    fn default_informer(&self, config: InformerConfig) -> SharedInformer<K> {
        let tweak = scoped_tweak(self.factory.namespace().map(str::to_string), Arc::clone(&self.tweak));
        SharedInformer::with_tweak_list_options(Arc::clone(&self.list_watch), config, namespace_indexers(), tweak)
    }

    pub fn informer(&self) -> Arc<SharedInformer<K>> {
        self.factory.informer_for(|cfg| self.default_informer(cfg))
    }

    pub fn lister(&self) -> Lister<K> {
        self.informer().lister()
    }
}

/// Pin every call to `namespace` before the caller's tweak runs.
fn scoped_tweak(namespace: Option<String>, tweak: TweakListOptions) -> TweakListOptions {
    match namespace {
        None => tweak,
        Some(ns) => Arc::new(move |opts: &mut ListOptions| {
            opts.namespace = Some(ns.clone());
            tweak(opts);
        }),
    }
}
