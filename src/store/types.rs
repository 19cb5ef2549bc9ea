use std::fmt;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Opaque, stable node identity. Seeded ids are usually numeric strings,
/// ids minted by a working cache are UUIDs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl ToSql for NodeId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for NodeId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        // Seeded tables may hold integer ids; they are still opaque to us.
        match value {
            ValueRef::Integer(raw) => Ok(Self(raw.to_string())),
            other => String::column_result(other).map(Self),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub text: String,
    pub is_obsolete: bool,
}

/// A node joined with its own closure self-edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredNode {
    #[serde(flatten)]
    pub node: Node,
    pub parent_id: Option<NodeId>,
    pub level: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureEdge {
    pub ancestor_id: NodeId,
    pub descendant_id: NodeId,
    pub parent_id: Option<NodeId>,
    /// Depth of the descendant below its tree root, repeated on every edge.
    pub level: u32,
    /// Tree edges between ancestor and descendant.
    pub distance: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub text: String,
    pub level: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextUpdate {
    pub id: NodeId,
    pub text: String,
}

/// Everything one push hands to the store. Applied as a single transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncBatch {
    pub inserts: Vec<NewNode>,
    pub updates: Vec<TextUpdate>,
    pub deletions: Vec<NodeId>,
}

impl SyncBatch {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreMeta {
    pub schema_version: i64,
    pub node_count: u64,
    pub edge_count: u64,
    pub seed_digest: Option<String>,
    pub seeded_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClosureViolation {
    MissingSelfEdge {
        node: NodeId,
    },
    BrokenWalk {
        ancestor: NodeId,
        descendant: NodeId,
        distance: i64,
    },
}

impl fmt::Display for ClosureViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSelfEdge { node } => write!(f, "node `{node}` has no self-edge"),
            Self::BrokenWalk {
                ancestor,
                descendant,
                distance,
            } => write!(
                f,
                "walking {distance} parent steps from `{descendant}` does not reach `{ancestor}`"
            ),
        }
    }
}
