use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::{NodeId, StoredNode};

/// Where a cached row stands relative to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowState {
    /// Matches the store as of the last push or load.
    Clean,
    /// Mirrors a stored node but carries unpushed edits or a deletion.
    Dirty,
    /// Created locally; the store has never seen it.
    New,
    /// Created locally and deleted before it was ever pushed.
    NewAndDeleted,
}

impl RowState {
    pub fn is_new(self) -> bool {
        matches!(self, Self::New | Self::NewAndDeleted)
    }

    pub fn is_synced(self) -> bool {
        self == Self::Clean
    }

    fn after_edit(self) -> Self {
        match self {
            Self::Clean | Self::Dirty => Self::Dirty,
            pending => pending,
        }
    }

    fn after_delete(self) -> Self {
        match self {
            Self::Clean | Self::Dirty => Self::Dirty,
            Self::New | Self::NewAndDeleted => Self::NewAndDeleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedRow {
    pub(super) id: NodeId,
    pub(super) parent_id: Option<NodeId>,
    pub(super) text: String,
    pub(super) level: u32,
    pub(super) is_obsolete: bool,
    pub(super) state: RowState,
    pub(super) last_modified_at: DateTime<Utc>,
    pub(super) last_synced_at: Option<DateTime<Utc>>,
}

impl CachedRow {
    pub(super) fn mirror(stored: StoredNode, now: DateTime<Utc>) -> Self {
        Self {
            id: stored.node.id,
            parent_id: stored.parent_id,
            text: stored.node.text,
            level: stored.level,
            is_obsolete: stored.node.is_obsolete,
            state: RowState::Clean,
            last_modified_at: now,
            last_synced_at: Some(now),
        }
    }

    pub(super) fn fresh(
        id: NodeId,
        parent_id: NodeId,
        text: String,
        level: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            parent_id: Some(parent_id),
            text,
            level,
            is_obsolete: false,
            state: RowState::New,
            last_modified_at: now,
            last_synced_at: None,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&NodeId> {
        self.parent_id.as_ref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn is_obsolete(&self) -> bool {
        self.is_obsolete
    }

    pub fn state(&self) -> RowState {
        self.state
    }

    pub fn is_new(&self) -> bool {
        self.state.is_new()
    }

    pub fn is_synced(&self) -> bool {
        self.state.is_synced()
    }

    pub fn last_modified_at(&self) -> DateTime<Utc> {
        self.last_modified_at
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    pub(super) fn set_text(&mut self, text: String, now: DateTime<Utc>) {
        self.text = text;
        self.state = self.state.after_edit();
        self.last_modified_at = now;
    }

    pub(super) fn mark_deleted(&mut self, now: DateTime<Utc>) {
        self.is_obsolete = true;
        self.state = self.state.after_delete();
        self.last_modified_at = now;
    }

    pub(super) fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.state = RowState::Clean;
        self.last_synced_at = Some(now);
    }

    /// The store reports this row obsolete; adopt that without making the
    /// row dirty again.
    pub(super) fn adopt_obsolete(&mut self, now: DateTime<Utc>) {
        self.is_obsolete = true;
        self.mark_synced(now);
    }
}
