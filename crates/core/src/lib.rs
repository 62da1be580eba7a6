//! Mirra core types: object identity, the list/watch contract and selectors.
//!
//! Everything above this crate is generic over [`Object`]; the only per-kind
//! specialization lives in identity extraction and index functions.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod selector;
pub mod watch;

pub use error::{Error, Result};
pub use selector::{FieldSelector, LabelSelector, Requirement, Selector};
pub use watch::{
    noop_tweak, ListOptions, ListWatch, ObjectList, Status, TweakListOptions, WatchEvent, WatchStream,
};

pub mod prelude {
    pub use super::{
        Error, ListOptions, ListWatch, Object, ObjectKey, ObjectList, Result, Selector, TweakListOptions,
        WatchEvent,
    };
}

/// Identity of a mirrored object: `namespace/name`, or `name` for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    /// Parse `ns/name` or `name`.
    pub fn parse(key: &str) -> Result<Self> {
        match key.split('/').collect::<Vec<_>>().as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(*name)),
            [ns, name] if !name.is_empty() => Ok(Self::new(Some(*ns), *name)),
            _ => Err(Error::InvalidKey(key.to_string())),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A versioned remote object that can be mirrored.
///
/// Implemented for every `kube::Resource`; the accessors read `metadata`.
pub trait Object: Clone + Send + Sync + 'static {
    fn name(&self) -> Option<&str>;
    fn namespace(&self) -> Option<&str>;
    fn resource_version(&self) -> Option<&str>;
    fn labels(&self) -> Option<&BTreeMap<String, String>>;

    /// Primary key; `None` when the object carries no name (malformed payload).
    fn key(&self) -> Option<ObjectKey> {
        let name = self.name().filter(|n| !n.is_empty())?;
        Some(ObjectKey::new(self.namespace(), name))
    }
}

impl<K> Object for K
where
    K: kube::Resource + Clone + Send + Sync + 'static,
{
    fn name(&self) -> Option<&str> {
        self.meta().name.as_deref()
    }

    fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.meta().labels.as_ref()
    }
}
