//! List-then-watch driver that keeps a sink in step with the remote collection.
//!
//! The reflector lists once, then watches from the list's resource version.
//! A watch that ends cleanly (server timeout) is resumed from the cursor; one
//! that fails relists after a backoff, and one whose cursor expired relists
//! immediately with an unversioned read. A watch that closes empty within
//! `MIN_WATCH_DURATION` is re-opened only after a backoff. Only a terminal
//! sink error (a handler queue overflow under `OverflowPolicy::Fail`) ends the
//! loop besides the stop token.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use mirra_core::{Error, ListOptions, ListWatch, Object, Result, TweakListOptions, WatchEvent};
use mirra_store::Store;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::InformerConfig;

/// A watch closing sooner than this without delivering anything is treated as suspect.
pub const MIN_WATCH_DURATION: Duration = Duration::from_secs(1);

/// Where the reflector is in its list/watch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReflectorPhase {
    Idle = 0,
    Listing = 1,
    Watching = 2,
    Relisting = 3,
    Stopped = 4,
}

impl ReflectorPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Listing,
            2 => Self::Watching,
            3 => Self::Relisting,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Cursor and phase, readable while the reflector runs.
#[derive(Debug)]
pub struct ReflectorState {
    cursor: ArcSwap<String>,
    phase: AtomicU8,
}

impl Default for ReflectorState {
    fn default() -> Self {
        Self { cursor: ArcSwap::from_pointee(String::new()), phase: AtomicU8::new(ReflectorPhase::Idle as u8) }
    }
}

impl ReflectorState {
    pub fn resource_version(&self) -> String {
        String::clone(&self.cursor.load())
    }

    pub fn phase(&self) -> ReflectorPhase {
        ReflectorPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_cursor(&self, rv: &str) {
        if !rv.is_empty() {
            self.cursor.store(Arc::new(rv.to_string()));
        }
    }

    fn set_phase(&self, phase: ReflectorPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Destination of everything the reflector observes.
#[async_trait::async_trait]
pub trait ReflectorSink<K: Object>: Send + Sync {
    /// Swap the whole content for a fresh list.
    async fn replace(&self, items: Vec<K>, resource_version: &str) -> Result<()>;
    async fn upsert(&self, obj: K) -> Result<()>;
    async fn delete(&self, obj: K) -> Result<()>;
    /// Re-deliver every stored object as an update.
    async fn resync(&self) -> Result<()>;
}

#[async_trait::async_trait]
impl<K: Object> ReflectorSink<K> for Store<K> {
    async fn replace(&self, items: Vec<K>, _resource_version: &str) -> Result<()> {
        Store::replace(self, items);
        Ok(())
    }

    async fn upsert(&self, obj: K) -> Result<()> {
        self.add(obj).map(|_| ())
    }

    async fn delete(&self, obj: K) -> Result<()> {
        self.delete_object(&obj).map(|_| ())
    }

    async fn resync(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl<K: Object, S: ReflectorSink<K> + ?Sized> ReflectorSink<K> for Arc<S> {
    async fn replace(&self, items: Vec<K>, resource_version: &str) -> Result<()> {
        (**self).replace(items, resource_version).await
    }

    async fn upsert(&self, obj: K) -> Result<()> {
        (**self).upsert(obj).await
    }

    async fn delete(&self, obj: K) -> Result<()> {
        (**self).delete(obj).await
    }

    async fn resync(&self) -> Result<()> {
        (**self).resync().await
    }
}

struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: None }
    }

    fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(d) => (d * 2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

enum WatchEnd {
    Stopped,
    /// Stream closed without error; resume from the cursor.
    Closed,
    /// Stream closed empty right after opening; resume after a backoff.
    TooShort,
    Expired,
    Failed(Error),
}

pub struct Reflector<K: Object, S> {
    name: String,
    list_watch: Arc<dyn ListWatch<K>>,
    sink: S,
    tweak: TweakListOptions,
    resync_period: Duration,
    watch_timeout: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    state: Arc<ReflectorState>,
}

impl<K: Object, S: ReflectorSink<K>> Reflector<K, S> {
    pub fn new(list_watch: Arc<dyn ListWatch<K>>, sink: S, config: &InformerConfig, tweak: TweakListOptions) -> Self {
        Self {
            name: list_watch.describe(),
            list_watch,
            sink,
            tweak,
            resync_period: config.resync_period,
            watch_timeout: config.watch_timeout,
            backoff_initial: config.backoff_initial,
            backoff_max: config.backoff_max,
            state: Arc::new(ReflectorState::default()),
        }
    }

    /// Share cursor/phase with an owner that outlives `run`.
    pub fn with_state(mut self, state: Arc<ReflectorState>) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> Arc<ReflectorState> {
        Arc::clone(&self.state)
    }

    pub fn last_sync_resource_version(&self) -> String {
        self.state.resource_version()
    }

    fn options(&self, resource_version: &str) -> ListOptions {
        let mut opts = ListOptions::default();
        (self.tweak)(&mut opts);
        opts.resource_version = resource_version.to_string();
        opts
    }

    /// Run until `stop` fires. Returns `Err` only for terminal sink errors.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        let mut backoff = Backoff::new(self.backoff_initial, self.backoff_max);
        let mut resync = self.resync_interval();
        let mut need_list = true;
        let mut expired = false;
        let mut listed_once = false;
        info!(kind = %self.name, resync_secs = self.resync_period.as_secs(), "reflector starting");

        let outcome = loop {
            if stop.is_cancelled() {
                break Ok(());
            }
            if need_list {
                self.state.set_phase(if listed_once { ReflectorPhase::Relisting } else { ReflectorPhase::Listing });
                let listed = tokio::select! {
                    _ = stop.cancelled() => break Ok(()),
                    r = self.list_once(expired) => r,
                };
                match listed {
                    Ok(()) => {
                        backoff.reset();
                        need_list = false;
                        expired = false;
                        listed_once = true;
                    }
                    Err(e) if e.is_terminal() => break Err(e),
                    Err(e) => {
                        if e.is_expired() {
                            expired = true;
                        }
                        let delay = backoff.next_delay();
                        warn!(kind = %self.name, error = %e, delay_ms = delay.as_millis() as u64, "list failed; retrying");
                        metrics::counter!("mirra_list_errors_total", 1, "kind" => self.name.clone());
                        if !sleep_or_stop(&stop, delay).await {
                            break Ok(());
                        }
                        continue;
                    }
                }
            }

            self.state.set_phase(ReflectorPhase::Watching);
            match self.watch_once(&stop, &mut resync).await {
                WatchEnd::Stopped => break Ok(()),
                WatchEnd::Closed => {
                    backoff.reset();
                    debug!(kind = %self.name, rv = %self.state.resource_version(), "watch closed; resuming from cursor");
                }
                WatchEnd::TooShort => {
                    let delay = backoff.next_delay();
                    warn!(kind = %self.name, delay_ms = delay.as_millis() as u64, "very short watch; backing off");
                    metrics::counter!("mirra_watch_errors_total", 1, "kind" => self.name.clone());
                    if !sleep_or_stop(&stop, delay).await {
                        break Ok(());
                    }
                }
                WatchEnd::Expired => {
                    info!(kind = %self.name, rv = %self.state.resource_version(), "watch cursor expired; relisting");
                    metrics::counter!("mirra_watch_expired_total", 1, "kind" => self.name.clone());
                    need_list = true;
                    expired = true;
                }
                WatchEnd::Failed(e) if e.is_terminal() => break Err(e),
                WatchEnd::Failed(e) => {
                    let delay = backoff.next_delay();
                    warn!(kind = %self.name, error = %e, delay_ms = delay.as_millis() as u64, "watch failed; relisting");
                    metrics::counter!("mirra_watch_errors_total", 1, "kind" => self.name.clone());
                    need_list = true;
                    if !sleep_or_stop(&stop, delay).await {
                        break Ok(());
                    }
                }
            }
        };

        self.state.set_phase(ReflectorPhase::Stopped);
        info!(kind = %self.name, "reflector stopped");
        outcome
    }

    async fn list_once(&self, expired: bool) -> Result<()> {
        // An expired cursor cannot serve a list either; ask for the latest state.
        let rv = if expired { String::new() } else { self.state.resource_version() };
        let opts = self.options(&rv);
        let list = self.list_watch.list(&opts).await?;
        let count = list.items.len();
        self.sink.replace(list.items, &list.resource_version).await?;
        self.state.set_cursor(&list.resource_version);
        metrics::counter!("mirra_relists_total", 1, "kind" => self.name.clone());
        info!(kind = %self.name, count, rv = %list.resource_version, "list applied");
        Ok(())
    }

    fn resync_interval(&self) -> Option<Interval> {
        if self.resync_period.is_zero() {
            return None;
        }
        let mut iv = tokio::time::interval_at(Instant::now() + self.resync_period, self.resync_period);
        iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(iv)
    }

    async fn watch_once(&self, stop: &CancellationToken, resync: &mut Option<Interval>) -> WatchEnd {
        let mut opts = self.options(&self.state.resource_version());
        opts.allow_bookmarks = true;
        opts.timeout_secs = Some(self.watch_timeout.as_secs().clamp(1, u32::MAX as u64) as u32);

        let opened = tokio::select! {
            _ = stop.cancelled() => return WatchEnd::Stopped,
            r = self.list_watch.watch(&opts) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) if e.is_expired() => return WatchEnd::Expired,
            Err(e) => return WatchEnd::Failed(e),
        };
        debug!(kind = %self.name, rv = %opts.resource_version, "watch opened");
        let opened_at = Instant::now();
        let mut received = 0usize;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return WatchEnd::Stopped,
                _ = tick(resync) => {
                    debug!(kind = %self.name, "resync");
                    // a blocked handler queue must not outlive the stop token
                    let done = tokio::select! {
                        _ = stop.cancelled() => return WatchEnd::Stopped,
                        r = self.sink.resync() => r,
                    };
                    if let Err(e) = done {
                        return WatchEnd::Failed(e);
                    }
                }
                item = stream.next() => match item {
                    None if received == 0 && opened_at.elapsed() < MIN_WATCH_DURATION => return WatchEnd::TooShort,
                    None => return WatchEnd::Closed,
                    Some(Ok(ev)) => {
                        received += 1;
                        let done = tokio::select! {
                            _ = stop.cancelled() => return WatchEnd::Stopped,
                            r = self.apply(ev) => r,
                        };
                        if let Err(e) = done {
                            return if e.is_expired() { WatchEnd::Expired } else { WatchEnd::Failed(e) };
                        }
                    }
                    Some(Err(e)) if e.is_expired() => return WatchEnd::Expired,
                    Some(Err(Error::Decode(msg))) => {
                        received += 1;
                        warn!(kind = %self.name, error = %msg, "discarding undecodable watch event");
                        metrics::counter!("mirra_events_discarded_total", 1, "kind" => self.name.clone());
                    }
                    Some(Err(e)) => return WatchEnd::Failed(e),
                }
            }
        }
    }

    async fn apply(&self, ev: WatchEvent<K>) -> Result<()> {
        let rv = ev.resource_version().map(str::to_string);
        let kind = ev.type_name();
        match ev {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                if obj.key().is_none() {
                    self.discard(kind);
                    return Ok(());
                }
                self.sink.upsert(obj).await?;
            }
            WatchEvent::Deleted(obj) => {
                if obj.key().is_none() {
                    self.discard(kind);
                    return Ok(());
                }
                self.sink.delete(obj).await?;
            }
            WatchEvent::Bookmark { .. } => {}
            WatchEvent::Error(status) if status.code == Error::GONE => return Err(Error::Expired(status.message)),
            WatchEvent::Error(status) => {
                return Err(Error::WatchStatus { code: status.code, message: status.message });
            }
        }
        if let Some(rv) = rv {
            self.state.set_cursor(&rv);
        }
        metrics::counter!("mirra_watch_events_total", 1, "kind" => self.name.clone(), "type" => kind);
        metrics::gauge!("mirra_last_event_ts", chrono::Utc::now().timestamp() as f64, "kind" => self.name.clone());
        Ok(())
    }

    fn discard(&self, kind: &'static str) {
        warn!(kind = %self.name, event = kind, "discarding watch event for object without identity");
        metrics::counter!("mirra_events_discarded_total", 1, "kind" => self.name.clone());
    }
}

async fn tick(iv: &mut Option<Interval>) {
    match iv {
        Some(iv) => {
            iv.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

/// Sleep for `d`; `false` if the stop token fired first.
async fn sleep_or_stop(stop: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}
