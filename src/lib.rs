//! Closure-table tree store with a dirty-tracked working cache.
//!
//! [`store::TreeStore`] keeps the durable tree in SQLite. [`cache::WorkingCache`]
//! buffers edits locally and commits them with [`cache::WorkingCache::push_to_store`].

pub mod cache;
pub mod config;
pub mod seed;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod tree;

pub use cache::{CacheError, CachedRow, PushReport, RowState, WorkingCache};
pub use store::{FatalError, NodeId, StoreError, StoredNode, TreeStore};
