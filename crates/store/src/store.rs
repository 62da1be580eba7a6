//! Thread-safe, indexed object store: the authoritative local mirror.

use std::sync::Arc;

use mirra_core::{Error, Object, ObjectKey, Result};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::index::{Indexers, Indices};

struct Inner<K> {
    items: FxHashMap<ObjectKey, Arc<K>>,
    indices: Indices<K>,
}

/// Result of an add/update: the stored object and the one it replaced.
#[derive(Debug)]
pub struct Upserted<K> {
    pub new: Arc<K>,
    pub old: Option<Arc<K>>,
}

/// What an atomic [`Store::replace`] changed, in list order (deletions unordered).
#[derive(Debug)]
pub struct ReplaceDiff<K> {
    pub added: Vec<Arc<K>>,
    pub updated: Vec<(Arc<K>, Arc<K>)>,
    pub deleted: Vec<Arc<K>>,
    /// Listed items dropped for lacking an identity.
    pub skipped: usize,
}

/// Read-only handle over a [`Store`]; what listers are built from.
pub struct StoreReader<K> {
    inner: Arc<RwLock<Inner<K>>>,
}

impl<K> Clone for StoreReader<K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K: Object> StoreReader<K> {
    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.inner.read().items.get(key).cloned()
    }

    pub fn get(&self, obj: &K) -> Option<Arc<K>> {
        obj.key().and_then(|k| self.get_by_key(&k))
    }

    /// Snapshot of every object at call time.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.inner.read().items.values().cloned().collect()
    }

    pub fn list_keys(&self) -> Vec<ObjectKey> {
        self.inner.read().items.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objects filed under `value` in index `index`.
    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>> {
        let inner = self.inner.read();
        let keys = inner.indices.keys_for(index, value)?;
        Ok(keys.iter().filter_map(|k| inner.items.get(k).cloned()).collect())
    }

    pub fn index_keys(&self, index: &str, value: &str) -> Result<Vec<ObjectKey>> {
        self.inner.read().indices.keys_for(index, value)
    }

    /// Every value currently present in `index`.
    pub fn list_index_values(&self, index: &str) -> Vec<String> {
        self.inner.read().indices.values_of(index)
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.inner.read().indices.indexers.contains_key(index)
    }
}

/// The authoritative mirror. Cloning yields another handle to the same store.
///
/// Every mutation takes the write lock once and updates the object map and all
/// postings together, so readers see an object fully applied or not at all.
pub struct Store<K> {
    reader: StoreReader<K>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self { reader: self.reader.clone() }
    }
}

impl<K: Object> Default for Store<K> {
    fn default() -> Self {
        Self::new(Indexers::new())
    }
}

impl<K: Object> Store<K> {
    pub fn new(indexers: Indexers<K>) -> Self {
        let inner = Inner { items: FxHashMap::default(), indices: Indices::new(indexers) };
        Self { reader: StoreReader { inner: Arc::new(RwLock::new(inner)) } }
    }

    pub fn reader(&self) -> StoreReader<K> {
        self.reader.clone()
    }

    fn key_of(obj: &K) -> Result<ObjectKey> {
        obj.key().ok_or_else(|| Error::InvalidKey("object has no name".to_string()))
    }

    /// Insert or replace `obj`, re-filing it in every index.
    pub fn add(&self, obj: K) -> Result<Upserted<K>> {
        let key = Self::key_of(&obj)?;
        let new = Arc::new(obj);
        let mut inner = self.reader.inner.write();
        let old = inner.items.insert(key.clone(), Arc::clone(&new));
        inner.indices.update(&key, old.as_deref(), Some(new.as_ref()));
        Ok(Upserted { new, old })
    }

    pub fn update(&self, obj: K) -> Result<Upserted<K>> {
        self.add(obj)
    }

    /// Remove `key` from the map and from all indexes.
    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let mut inner = self.reader.inner.write();
        let old = inner.items.remove(key)?;
        inner.indices.update(key, Some(old.as_ref()), None);
        Some(old)
    }

    pub fn delete_object(&self, obj: &K) -> Result<Option<Arc<K>>> {
        Ok(self.delete(&Self::key_of(obj)?))
    }

    /// Atomically swap the whole content for `items`.
    ///
    /// Objects absent from `items` are removed; the rest are added or updated.
    /// Duplicated identities keep the last occurrence.
    pub fn replace(&self, items: Vec<K>) -> ReplaceDiff<K> {
        let mut skipped = 0usize;
        let mut order: Vec<ObjectKey> = Vec::with_capacity(items.len());
        let mut next: FxHashMap<ObjectKey, Arc<K>> = FxHashMap::default();
        for obj in items {
            let Some(key) = obj.key() else {
                skipped += 1;
                continue;
            };
            if next.insert(key.clone(), Arc::new(obj)).is_none() {
                order.push(key);
            }
        }
        if skipped > 0 {
            warn!(skipped, "replace: dropped listed objects without identity");
        }

        let mut inner = self.reader.inner.write();
        let mut prev = std::mem::take(&mut inner.items);
        let mut added = Vec::new();
        let mut updated = Vec::new();
        inner.indices.clear();
        for key in order.iter() {
            let Some(obj) = next.get(key) else { continue };
            inner.indices.update(key, None, Some(obj.as_ref()));
            match prev.remove(key) {
                Some(old) => updated.push((old, Arc::clone(obj))),
                None => added.push(Arc::clone(obj)),
            }
        }
        let deleted: Vec<Arc<K>> = prev.into_values().collect();
        inner.items = next;
        ReplaceDiff { added, updated, deleted, skipped }
    }

    /// Register more indexers; only allowed while the store is empty.
    pub fn add_indexers(&self, indexers: Indexers<K>) -> Result<()> {
        let mut inner = self.reader.inner.write();
        if !inner.items.is_empty() {
            return Err(Error::IndexersAfterStart);
        }
        inner.indices.add_indexers(indexers)
    }

    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.reader.get_by_key(key)
    }

    pub fn get(&self, obj: &K) -> Option<Arc<K>> {
        self.reader.get(obj)
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.reader.list()
    }

    pub fn list_keys(&self) -> Vec<ObjectKey> {
        self.reader.list_keys()
    }

    pub fn len(&self) -> usize {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>> {
        self.reader.by_index(index, value)
    }

    pub fn index_keys(&self, index: &str, value: &str) -> Result<Vec<ObjectKey>> {
        self.reader.index_keys(index, value)
    }

    pub fn list_index_values(&self, index: &str) -> Vec<String> {
        self.reader.list_index_values(index)
    }
}
