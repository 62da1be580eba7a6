//! Typed read-only query surface over a store.
//!
//! Listers never touch the network and answer from whatever the store holds.

use std::sync::Arc;

use mirra_core::{Object, ObjectKey, Selector};

use crate::index::NAMESPACE_INDEX;
use crate::store::StoreReader;

pub struct Lister<K> {
    store: StoreReader<K>,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone() }
    }
}

impl<K: Object> Lister<K> {
    pub fn new(store: StoreReader<K>) -> Self {
        Self { store }
    }

    /// All objects matching `selector`, unordered.
    pub fn list(&self, selector: &Selector) -> Vec<Arc<K>> {
        filter(self.store.list(), selector)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.store.get_by_key(&ObjectKey::new(Some(namespace), name))
    }

    /// Lookup for cluster-scoped kinds.
    pub fn get_cluster(&self, name: &str) -> Option<Arc<K>> {
        self.store.get_by_key(&ObjectKey::cluster(name))
    }

    pub fn namespaced(&self, namespace: &str) -> NamespaceLister<K> {
        NamespaceLister { store: self.store.clone(), namespace: namespace.to_string() }
    }
}

/// Lister scoped to one namespace.
pub struct NamespaceLister<K> {
    store: StoreReader<K>,
    namespace: String,
}

impl<K: Object> NamespaceLister<K> {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get(&self, name: &str) -> Option<Arc<K>> {
        self.store.get_by_key(&ObjectKey::new(Some(self.namespace.as_str()), name))
    }

    pub fn list(&self, selector: &Selector) -> Vec<Arc<K>> {
        let candidates = match self.store.by_index(NAMESPACE_INDEX, &self.namespace) {
            Ok(objs) => objs,
            // no namespace index: scan
            Err(_) => self
                .store
                .list()
                .into_iter()
                .filter(|o| o.namespace().unwrap_or("") == self.namespace)
                .collect(),
        };
        filter(candidates, selector)
    }
}

fn filter<K: Object>(objs: Vec<Arc<K>>, selector: &Selector) -> Vec<Arc<K>> {
    if selector.is_everything() {
        return objs;
    }
    objs.into_iter().filter(|o| selector.matches(&**o)).collect()
}
