//! The list/watch contract consumed from the client collaborator.

use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{Object, Result};

/// Query parameters carried by every list and watch call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    /// Restrict to one namespace; `None` means every namespace.
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Cursor; empty means "most recent" (a consistent read on list).
    pub resource_version: String,
    /// Server-side timeout for watch calls.
    pub timeout_secs: Option<u32>,
    pub allow_bookmarks: bool,
    pub limit: Option<u32>,
}

/// Hook that mutates query parameters before each list and watch call.
pub type TweakListOptions = Arc<dyn Fn(&mut ListOptions) + Send + Sync>;

pub fn noop_tweak() -> TweakListOptions {
    Arc::new(|_| {})
}

/// Snapshot returned by a list call.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// Terminal status carried by an `Error` watch event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker: advances the cursor, carries no object.
    Bookmark { resource_version: String },
    Error(Status),
}

impl<K: Object> WatchEvent<K> {
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o.resource_version(),
            WatchEvent::Bookmark { resource_version } => Some(resource_version.as_str()),
            WatchEvent::Error(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Modified(_) => "modified",
            WatchEvent::Deleted(_) => "deleted",
            WatchEvent::Bookmark { .. } => "bookmark",
            WatchEvent::Error(_) => "error",
        }
    }
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// Remote source of a resource collection.
///
/// `watch` streams are expected to yield `Err(Error::Decode)` for payloads that
/// fail to decode and to keep going; any other `Err` item ends the stream.
#[async_trait::async_trait]
pub trait ListWatch<K: Object>: Send + Sync + 'static {
    async fn list(&self, opts: &ListOptions) -> Result<ObjectList<K>>;
    async fn watch(&self, opts: &ListOptions) -> Result<WatchStream<K>>;

    /// Human readable name used in logs and metrics labels.
    fn describe(&self) -> String {
        std::any::type_name::<K>().rsplit("::").next().unwrap_or("object").to_string()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.code, self.reason, self.message)
    }
}
