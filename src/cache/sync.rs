use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::cache::{CacheError, CachedRow, WorkingCache};
use crate::store::{NewNode, NodeId, StoreError, SyncBatch, TextUpdate, TreeStore};

/// The store-side half of a push.
pub trait SyncTarget {
    /// Applies the whole batch or nothing.
    fn apply_batch(&self, batch: &SyncBatch) -> Result<(), StoreError>;

    /// The subset of `ids` the store currently holds as obsolete.
    fn find_obsolete_among(&self, ids: &[NodeId]) -> Result<BTreeSet<NodeId>, StoreError>;
}

impl SyncTarget for TreeStore {
    fn apply_batch(&self, batch: &SyncBatch) -> Result<(), StoreError> {
        TreeStore::apply_batch(self, batch)
    }

    fn find_obsolete_among(&self, ids: &[NodeId]) -> Result<BTreeSet<NodeId>, StoreError> {
        TreeStore::find_obsolete_among(self, ids)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Every cached id the store holds as obsolete after the push, whether
    /// this cache deleted it, the store cascaded to it, or another writer
    /// did.
    pub obsolete: BTreeSet<NodeId>,
    pub synced_at: DateTime<Utc>,
}

/// Splits unsynced rows into the batch the store needs. A row can be both
/// inserted and deleted when it was created and removed since the last push.
pub fn plan_batch<'a, I>(rows: I) -> SyncBatch
where
    I: IntoIterator<Item = &'a CachedRow>,
{
    let mut batch = SyncBatch::default();
    for row in rows.into_iter().filter(|row| !row.is_synced()) {
        if row.is_new() {
            batch.inserts.push(NewNode {
                id: row.id.clone(),
                parent_id: row.parent_id.clone(),
                text: row.text.clone(),
                level: row.level,
            });
        } else {
            batch.updates.push(TextUpdate {
                id: row.id.clone(),
                text: row.text.clone(),
            });
        }
        if row.is_obsolete {
            batch.deletions.push(row.id.clone());
        }
    }
    batch
        .inserts
        .sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id.cmp(&b.id)));
    batch
}

impl WorkingCache {
    /// Commits every unsynced row to `target` and pulls back obsolescence
    /// for every cached id.
    ///
    /// A failed batch leaves both the store and the cache untouched, so the
    /// push can simply be retried.
    pub fn push_to_store<T>(&mut self, target: &T) -> Result<PushReport, CacheError>
    where
        T: SyncTarget + ?Sized,
    {
        let all_ids: Vec<NodeId> = self.rows.keys().cloned().collect();
        let dirty: Vec<NodeId> = self
            .rows
            .values()
            .filter(|row| !row.is_synced())
            .map(|row| row.id.clone())
            .collect();
        let batch = plan_batch(self.rows.values());

        if !batch.is_empty() {
            target.apply_batch(&batch)?;
        }

        // The batch is committed from here on. Committed rows are marked
        // synced before reconciliation so a failed lookup cannot make the
        // next push resend them.
        let reconciled = target.find_obsolete_among(&all_ids);
        let now = Utc::now();
        for id in &dirty {
            if let Some(row) = self.rows.get_mut(id) {
                row.mark_synced(now);
            }
        }
        let obsolete = reconciled.inspect_err(|err| {
            warn!(error = %err, "batch committed but obsolescence lookup failed");
        })?;
        for id in &obsolete {
            if let Some(row) = self.rows.get_mut(id) {
                row.adopt_obsolete(now);
            }
        }

        info!(
            inserted = batch.inserts.len(),
            updated = batch.updates.len(),
            deleted = batch.deletions.len(),
            obsolete = obsolete.len(),
            "cache pushed"
        );
        Ok(PushReport {
            inserted: batch.inserts.len(),
            updated: batch.updates.len(),
            deleted: batch.deletions.len(),
            obsolete,
            synced_at: now,
        })
    }
}
