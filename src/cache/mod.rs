//! Volatile working copy of part of the tree.
//!
//! Mutators here never touch the store. Edits accumulate until
//! [`WorkingCache::push_to_store`] commits them as one batch.

mod row;
mod sync;

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::store::{NodeId, StoreError, StoredNode, TreeStore};

pub use row::{CachedRow, RowState};
pub use sync::{PushReport, SyncTarget, plan_batch};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("node `{0}` is not in the cache")]
    NotFound(NodeId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CacheError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Store(err) => err.code(),
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkingCache {
    rows: BTreeMap<NodeId, CachedRow>,
}

impl WorkingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole cache with rows mirrored from the store.
    pub fn load<I>(&mut self, rows: I)
    where
        I: IntoIterator<Item = StoredNode>,
    {
        let now = Utc::now();
        self.rows = rows
            .into_iter()
            .map(|stored| (stored.node.id.clone(), CachedRow::mirror(stored, now)))
            .collect();
        debug!(rows = self.rows.len(), "cache loaded");
    }

    /// Adds one stored node to the cache. Any cached copy, pending edits
    /// included, is replaced.
    pub fn cache_node(&mut self, stored: StoredNode) -> &CachedRow {
        let id = stored.node.id.clone();
        let row = CachedRow::mirror(stored, Utc::now());
        debug!(id = %id, "node cached");
        self.rows.insert(id.clone(), row);
        &self.rows[&id]
    }

    /// Pulls `id` from the store into the cache.
    pub fn checkout(&mut self, store: &TreeStore, id: &NodeId) -> Result<&CachedRow, CacheError> {
        let stored = store.get_node(id)?;
        Ok(self.cache_node(stored))
    }

    /// Creates a child of a cached row under a fresh id. The row exists only
    /// in the cache until the next push.
    pub fn create(&mut self, parent_id: &NodeId, text: impl Into<String>) -> Result<NodeId, CacheError> {
        let level = self.get(parent_id)?.level + 1;
        let id = NodeId::new(Uuid::new_v4().to_string());
        let row = CachedRow::fresh(id.clone(), parent_id.clone(), text.into(), level, Utc::now());
        debug!(id = %id, parent = %parent_id, level, "row created");
        self.rows.insert(id.clone(), row);
        Ok(id)
    }

    pub fn edit(&mut self, id: &NodeId, text: impl Into<String>) -> Result<(), CacheError> {
        let row = self.get_mut(id)?;
        row.set_text(text.into(), Utc::now());
        debug!(id = %id, state = ?row.state, "row edited");
        Ok(())
    }

    /// Marks one row obsolete. Descendants are not touched here; the store
    /// cascades the deletion on push and the push reports them back.
    pub fn delete(&mut self, id: &NodeId) -> Result<(), CacheError> {
        let row = self.get_mut(id)?;
        row.mark_deleted(Utc::now());
        debug!(id = %id, state = ?row.state, "row deleted");
        Ok(())
    }

    pub fn get(&self, id: &NodeId) -> Result<&CachedRow, CacheError> {
        self.rows
            .get(id)
            .ok_or_else(|| CacheError::NotFound(id.clone()))
    }

    fn get_mut(&mut self, id: &NodeId) -> Result<&mut CachedRow, CacheError> {
        self.rows
            .get_mut(id)
            .ok_or_else(|| CacheError::NotFound(id.clone()))
    }

    /// All rows ordered by level, then parent id, then id.
    pub fn snapshot(&self) -> Snapshot<'_> {
        let mut rows: Vec<&CachedRow> = self.rows.values().collect();
        rows.sort_by(|a, b| {
            a.level
                .cmp(&b.level)
                .then_with(|| a.parent_id.cmp(&b.parent_id))
                .then_with(|| a.id.cmp(&b.id))
        });
        Snapshot { rows }
    }

    pub fn reset(&mut self) {
        self.rows.clear();
        debug!("cache reset");
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.rows.values().filter(|row| !row.is_synced()).count()
    }
}

/// Level-ordered view over the cache. Iterate it as many times as needed.
#[derive(Debug, Clone)]
pub struct Snapshot<'a> {
    rows: Vec<&'a CachedRow>,
}

impl<'a> Snapshot<'a> {
    pub fn iter(&self) -> impl Iterator<Item = &'a CachedRow> + '_ {
        self.rows.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<'a> IntoIterator for Snapshot<'a> {
    type Item = &'a CachedRow;
    type IntoIter = std::vec::IntoIter<&'a CachedRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
