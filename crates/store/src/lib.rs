//! Mirra store: the indexed in-RAM mirror and the listers reading it.

#![forbid(unsafe_code)]

pub mod index;
pub mod lister;
pub mod store;

pub use index::{
    index_func, namespace_index_func, namespace_indexers, IndexFunc, IndexValues, Indexers, NAMESPACE_INDEX,
};
pub use lister::{Lister, NamespaceLister};
pub use store::{ReplaceDiff, Store, StoreReader, Upserted};
