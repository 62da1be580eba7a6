//! Informer tuning knobs, with `MIRRA_*` environment overrides.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// What happens when a handler's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Stop the informer with `Error::QueueOverflow`.
    #[default]
    Fail,
    /// Drop the oldest queued notification for that handler and count it.
    DropOldest,
    /// Make the reflector wait until the handler catches up.
    Block,
}

/// What happens to queued notifications when the informer stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownPolicy {
    #[default]
    Drain,
    Discard,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} policy: {value}")]
pub struct UnknownPolicy {
    kind: &'static str,
    value: String,
}

impl FromStr for OverflowPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "drop-oldest" | "drop_oldest" | "drop" => Ok(Self::DropOldest),
            "block" => Ok(Self::Block),
            _ => Err(UnknownPolicy { kind: "overflow", value: s.to_string() }),
        }
    }
}

impl FromStr for ShutdownPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "discard" => Ok(Self::Discard),
            _ => Err(UnknownPolicy { kind: "shutdown", value: s.to_string() }),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fail => "fail",
            Self::DropOldest => "drop-oldest",
            Self::Block => "block",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformerConfig {
    /// Period of synthetic updates for every stored object; zero disables resync.
    pub resync_period: Duration,
    /// Per-handler queue bound.
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub shutdown_policy: ShutdownPolicy,
    /// Server-side timeout requested on each watch call.
    pub watch_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Poll period of `wait_for_cache_sync`.
    pub sync_poll_interval: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::ZERO,
            queue_capacity: 4096,
            overflow_policy: OverflowPolicy::Fail,
            shutdown_policy: ShutdownPolicy::Drain,
            watch_timeout: Duration::from_secs(290),
            backoff_initial: Duration::from_millis(800),
            backoff_max: Duration::from_secs(30),
            sync_poll_interval: Duration::from_millis(100),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

impl InformerConfig {
    /// Defaults overridden by `MIRRA_RESYNC_SECS`, `MIRRA_QUEUE_CAPACITY`,
    /// `MIRRA_OVERFLOW_POLICY`, `MIRRA_SHUTDOWN_POLICY`, `MIRRA_WATCH_TIMEOUT_SECS`
    /// and `MIRRA_WATCH_BACKOFF_MAX_SECS`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = env_parse::<u64>("MIRRA_RESYNC_SECS") {
            cfg.resync_period = Duration::from_secs(secs);
        }
        if let Some(cap) = env_parse::<usize>("MIRRA_QUEUE_CAPACITY") {
            cfg.queue_capacity = cap.max(1);
        }
        if let Some(p) = env_parse::<OverflowPolicy>("MIRRA_OVERFLOW_POLICY") {
            cfg.overflow_policy = p;
        }
        if let Some(p) = env_parse::<ShutdownPolicy>("MIRRA_SHUTDOWN_POLICY") {
            cfg.shutdown_policy = p;
        }
        if let Some(secs) = env_parse::<u64>("MIRRA_WATCH_TIMEOUT_SECS") {
            cfg.watch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("MIRRA_WATCH_BACKOFF_MAX_SECS") {
            cfg.backoff_max = Duration::from_secs(secs.max(1));
        }
        cfg
    }

    pub fn with_resync(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn with_queue(mut self, capacity: usize, policy: OverflowPolicy) -> Self {
        self.queue_capacity = capacity.max(1);
        self.overflow_policy = policy;
        self
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = policy;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max.max(initial);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_parse() {
        assert_eq!("drop-oldest".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::DropOldest);
        assert_eq!("BLOCK".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Block);
        assert_eq!("discard".parse::<ShutdownPolicy>().unwrap(), ShutdownPolicy::Discard);
        assert!("sometimes".parse::<OverflowPolicy>().is_err());
        assert_eq!(OverflowPolicy::DropOldest.to_string(), "drop-oldest");
    }

    #[test]
    fn builder_clamps() {
        let cfg = InformerConfig::default()
            .with_queue(0, OverflowPolicy::Block)
            .with_backoff(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(cfg.queue_capacity, 1);
        assert_eq!(cfg.backoff_max, Duration::from_secs(5));
        assert_eq!(InformerConfig::default().resync_period, Duration::ZERO);
    }
}
