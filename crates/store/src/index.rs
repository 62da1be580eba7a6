//! Secondary indexes: named key-derivation functions and their postings.

use std::collections::HashMap;
use std::sync::Arc;

use mirra_core::{Object, ObjectKey};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};

/// Values an object is filed under for one index.
pub type IndexValues = SmallVec<[String; 2]>;

/// Derives zero or more index values from an object.
pub type IndexFunc<K> = Arc<dyn Fn(&K) -> IndexValues + Send + Sync>;

/// Index name -> derivation function.
pub type Indexers<K> = HashMap<String, IndexFunc<K>>;

pub const NAMESPACE_INDEX: &str = "namespace";

/// Files namespaced objects under their namespace; cluster-scoped objects under "".
pub fn namespace_index_func<K: Object>(obj: &K) -> IndexValues {
    smallvec![obj.namespace().unwrap_or("").to_string()]
}

/// The indexers every informer built by the factory carries.
pub fn namespace_indexers<K: Object>() -> Indexers<K> {
    let mut out: Indexers<K> = HashMap::new();
    out.insert(NAMESPACE_INDEX.to_string(), Arc::new(namespace_index_func::<K>));
    out
}

/// Wrap a closure as an [`IndexFunc`].
pub fn index_func<K, F>(f: F) -> IndexFunc<K>
where
    F: Fn(&K) -> IndexValues + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Postings for one index: value -> identities.
pub(crate) type Postings = FxHashMap<String, FxHashSet<ObjectKey>>;

/// All postings, keyed by index name. Mutated only under the store's write lock.
pub(crate) struct Indices<K> {
    pub(crate) indexers: Indexers<K>,
    pub(crate) postings: FxHashMap<String, Postings>,
}

impl<K: Object> Indices<K> {
    pub(crate) fn new(indexers: Indexers<K>) -> Self {
        let postings = indexers.keys().map(|name| (name.clone(), Postings::default())).collect();
        Self { indexers, postings }
    }

    /// Re-file `key`: drop the values derived from `old`, add those derived from `new`.
    pub(crate) fn update(&mut self, key: &ObjectKey, old: Option<&K>, new: Option<&K>) {
        for (name, f) in self.indexers.iter() {
            let postings = self.postings.entry(name.clone()).or_default();
            let old_vals = old.map(|o| f(o)).unwrap_or_default();
            let new_vals = new.map(|o| f(o)).unwrap_or_default();
            for v in old_vals.iter().filter(|v| !new_vals.contains(v)) {
                if let Some(set) = postings.get_mut(v) {
                    set.remove(key);
                    if set.is_empty() {
                        postings.remove(v);
                    }
                }
            }
            for v in new_vals {
                postings.entry(v).or_default().insert(key.clone());
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        for postings in self.postings.values_mut() {
            postings.clear();
        }
    }

    pub(crate) fn add_indexers(&mut self, indexers: Indexers<K>) -> mirra_core::Result<()> {
        if let Some(dup) = indexers.keys().find(|n| self.indexers.contains_key(*n)) {
            return Err(mirra_core::Error::IndexerConflict(dup.clone()));
        }
        for (name, f) in indexers {
            self.postings.insert(name.clone(), Postings::default());
            self.indexers.insert(name, f);
        }
        Ok(())
    }

    pub(crate) fn keys_for(&self, index: &str, value: &str) -> mirra_core::Result<Vec<ObjectKey>> {
        let postings = self
            .postings
            .get(index)
            .ok_or_else(|| mirra_core::Error::IndexNotFound(index.to_string()))?;
        Ok(postings.get(value).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    pub(crate) fn values_of(&self, index: &str) -> Vec<String> {
        self.postings.get(index).map(|p| p.keys().cloned().collect()).unwrap_or_default()
    }
}
