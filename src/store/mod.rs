pub mod atomic;
mod error;
mod open;
mod types;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params, params_from_iter,
};
use tracing::{debug, info};

use crate::seed::SeedData;

pub use error::{FatalError, StoreError};
pub use open::{OpenPhase, OpenReport, StoreConfig, open, open_with_report};
pub use types::{
    ClosureEdge, ClosureViolation, NewNode, Node, NodeId, StoreMeta, StoredNode, SyncBatch,
    TextUpdate,
};

const SCHEMA_VERSION: i64 = 1;
// Stays well below SQLITE_MAX_VARIABLE_NUMBER on every SQLite build.
const MAX_BOUND_IDS: usize = 500;

const NODE_COLUMNS: &str = "n.id, n.text, n.is_obsolete, c.parent_id, c.level";

/// Durable tree: a node table plus a closure table holding one edge per
/// (ancestor, descendant) pair, self-edges included.
pub struct TreeStore {
    conn: Connection,
}

impl TreeStore {
    /// Opens the database file and brings the schema up to date. No sanity
    /// check or seeding happens here; see [`open`] for that.
    pub fn open_path(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), StoreError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                self.create_schema_v1()?;
                self.conn
                    .execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
            }
            SCHEMA_VERSION => self.create_schema_v1()?,
            other => return Err(StoreError::UnsupportedSchema(other)),
        }
        Ok(())
    }

    fn create_schema_v1(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT NOT NULL PRIMARY KEY,
                text TEXT NOT NULL,
                is_obsolete INTEGER NOT NULL DEFAULT 0 CHECK (is_obsolete IN (0, 1))
            );

            CREATE TABLE IF NOT EXISTS closure (
                ancestor_id TEXT NOT NULL,
                descendant_id TEXT NOT NULL,
                parent_id TEXT,
                level INTEGER NOT NULL CHECK (level >= 0),
                distance INTEGER NOT NULL,
                PRIMARY KEY (ancestor_id, descendant_id)
            );

            CREATE INDEX IF NOT EXISTS idx_closure_descendant ON closure(descendant_id);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT NOT NULL PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )
    }

    fn write_tx(&self) -> rusqlite::Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
    }

    pub fn get_node(&self, id: &NodeId) -> Result<StoredNode, StoreError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {NODE_COLUMNS}
                     FROM nodes n
                     JOIN closure c ON c.descendant_id = n.id AND c.ancestor_id = n.id
                     WHERE n.id = ?1"
                ),
                params![id],
                stored_node_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// Every node under `root` (inclusive), ordered by level, then parent id,
    /// then id. Siblings end up adjacent, but a parent is not guaranteed to
    /// directly precede its own children.
    pub fn list_subtree(&self, root: &NodeId) -> Result<Vec<StoredNode>, StoreError> {
        if !node_exists_on(&self.conn, root)? {
            return Err(StoreError::NotFound(root.clone()));
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NODE_COLUMNS}
             FROM closure c
             JOIN nodes n ON n.id = c.descendant_id
             WHERE c.ancestor_id = ?1
             ORDER BY c.level ASC, c.parent_id ASC, n.id ASC"
        ))?;
        let rows = stmt.query_map(params![root], stored_node_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The whole forest in the same order as [`TreeStore::list_subtree`].
    pub fn list_all(&self) -> Result<Vec<StoredNode>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NODE_COLUMNS}
             FROM closure c
             JOIN nodes n ON n.id = c.descendant_id
             WHERE c.ancestor_id = c.descendant_id
             ORDER BY c.level ASC, c.parent_id ASC, n.id ASC"
        ))?;
        let rows = stmt.query_map([], stored_node_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every closure edge, as written by the bulk-load export. A negative
    /// distance left behind by inconsistent seed tables is `Corrupt`.
    pub fn closure_edges(&self) -> Result<Vec<ClosureEdge>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT ancestor_id, descendant_id, parent_id, level, distance
             FROM closure
             ORDER BY level ASC, descendant_id ASC, distance DESC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let ancestor_id: NodeId = row.get(0)?;
            let descendant_id: NodeId = row.get(1)?;
            let distance: i64 = row.get(4)?;
            let distance = u32::try_from(distance).map_err(|_| {
                StoreError::Corrupt(format!(
                    "edge `{ancestor_id}` -> `{descendant_id}` has distance {distance}"
                ))
            })?;
            out.push(ClosureEdge {
                ancestor_id,
                descendant_id,
                parent_id: row.get(2)?,
                level: row.get(3)?,
                distance,
            });
        }
        Ok(out)
    }

    /// Inserts `node` beneath its parent, making it a descendant of every
    /// ancestor of that parent.
    pub fn insert_node(&self, node: &NewNode) -> Result<(), StoreError> {
        let tx = self.write_tx()?;
        insert_node_on(&tx, node)?;
        tx.commit()?;
        Ok(())
    }

    pub fn update_text(&self, id: &NodeId, text: &str) -> Result<(), StoreError> {
        update_text_on(&self.conn, id, text)
    }

    /// Marks `id` and all of its descendants obsolete. Returns how many nodes
    /// flipped; already-obsolete nodes are left alone.
    pub fn soft_delete(&self, id: &NodeId) -> Result<usize, StoreError> {
        let tx = self.write_tx()?;
        let marked = soft_delete_on(&tx, id)?;
        tx.commit()?;
        Ok(marked)
    }

    pub fn find_obsolete_among<'a, I>(&self, ids: I) -> Result<BTreeSet<NodeId>, StoreError>
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        let ids: Vec<&NodeId> = ids.into_iter().collect();
        let mut out = BTreeSet::new();
        for chunk in ids.chunks(MAX_BOUND_IDS) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut stmt = self.conn.prepare(&format!(
                "SELECT id FROM nodes WHERE is_obsolete = 1 AND id IN ({placeholders})"
            ))?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get(0))?;
            for id in rows {
                out.insert(id?);
            }
        }
        Ok(out)
    }

    /// Applies inserts, text updates and soft deletes as one transaction.
    /// Inserts go shallowest first so new parents exist before new children.
    pub fn apply_batch(&self, batch: &SyncBatch) -> Result<(), StoreError> {
        let result = self
            .write_tx()
            .map_err(StoreError::from)
            .and_then(|tx| {
                apply_batch_on(&tx, batch)?;
                tx.commit()?;
                Ok(())
            });
        match result {
            Ok(()) => {
                info!(
                    inserted = batch.inserts.len(),
                    updated = batch.updates.len(),
                    deleted = batch.deletions.len(),
                    "batch committed"
                );
                Ok(())
            }
            Err(err) => Err(StoreError::TransactionFailure(Box::new(err))),
        }
    }

    /// Replaces the whole store with pre-materialized closure and node
    /// tables. Closure propagation is bypassed; `distance` is derived from
    /// the self-edge levels afterwards.
    pub fn seed(&self, seed: &SeedData) -> Result<(), StoreError> {
        let tx = self.write_tx()?;
        tx.execute_batch("DELETE FROM closure; DELETE FROM nodes;")?;
        {
            let mut insert_node =
                tx.prepare("INSERT INTO nodes (id, text, is_obsolete) VALUES (?1, ?2, ?3)")?;
            for node in &seed.nodes {
                insert_node.execute(params![node.id, node.text, node.is_obsolete])?;
            }
            let mut insert_edge = tx.prepare(
                "INSERT INTO closure (ancestor_id, descendant_id, parent_id, level, distance)
                 VALUES (?1, ?2, ?3, ?4, 0)",
            )?;
            for edge in &seed.edges {
                insert_edge.execute(params![
                    edge.ancestor_id,
                    edge.descendant_id,
                    edge.parent_id,
                    edge.level
                ])?;
            }
        }
        tx.execute_batch(
            "
            UPDATE closure SET parent_id = NULL
            WHERE parent_id IS NOT NULL AND parent_id NOT IN (SELECT id FROM nodes);

            UPDATE closure SET distance = level - COALESCE(
                (SELECT s.level FROM closure AS s
                 WHERE s.ancestor_id = closure.ancestor_id
                   AND s.descendant_id = closure.ancestor_id),
                0
            );
            ",
        )?;
        put_meta_on(&tx, "seed_digest", &seed.digest)?;
        put_meta_on(&tx, "seeded_at", &Utc::now().to_rfc3339())?;
        tx.commit()?;
        info!(
            nodes = seed.nodes.len(),
            edges = seed.edges.len(),
            digest = %seed.digest,
            "store seeded"
        );
        Ok(())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        let any: bool = self
            .conn
            .query_row("SELECT EXISTS(SELECT 1 FROM nodes)", [], |row| row.get(0))?;
        Ok(!any)
    }

    pub fn meta(&self) -> Result<StoreMeta, StoreError> {
        let schema_version = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let node_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
        let edge_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM closure", [], |row| row.get(0))?;
        Ok(StoreMeta {
            schema_version,
            node_count: node_count.unsigned_abs(),
            edge_count: edge_count.unsigned_abs(),
            seed_digest: self.get_meta("seed_digest")?,
            seeded_at: self.get_meta("seeded_at")?,
        })
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Reports nodes without a self-edge and edges whose `distance` walk up
    /// the parent chain does not land on their ancestor.
    pub fn verify_closure(&self) -> Result<Vec<ClosureViolation>, StoreError> {
        let mut violations = Vec::new();

        let mut missing = self.conn.prepare(
            "SELECT id FROM nodes
             WHERE NOT EXISTS (
                SELECT 1 FROM closure c WHERE c.ancestor_id = nodes.id AND c.descendant_id = nodes.id
             )
             ORDER BY id",
        )?;
        for node in missing.query_map([], |row| row.get(0))? {
            violations.push(ClosureViolation::MissingSelfEdge { node: node? });
        }

        let mut parents: HashMap<NodeId, Option<NodeId>> = HashMap::new();
        let mut self_edges = self
            .conn
            .prepare("SELECT descendant_id, parent_id FROM closure WHERE ancestor_id = descendant_id")?;
        for pair in self_edges.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))? {
            let (node, parent) = pair?;
            parents.insert(node, parent);
        }

        let mut edges = self.conn.prepare(
            "SELECT ancestor_id, descendant_id, distance FROM closure
             ORDER BY descendant_id, ancestor_id",
        )?;
        let rows = edges.query_map([], |row| {
            Ok((
                row.get::<_, NodeId>(0)?,
                row.get::<_, NodeId>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (ancestor, descendant, distance) = row?;
            if !walk_reaches(&parents, &descendant, &ancestor, distance) {
                violations.push(ClosureViolation::BrokenWalk {
                    ancestor,
                    descendant,
                    distance,
                });
            }
        }
        Ok(violations)
    }

    /// Cheap integrity check used while opening: SQLite's own check plus a
    /// full tree read.
    pub(crate) fn sanity_check(&self) -> Result<(), StoreError> {
        let verdict: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            return Err(StoreError::Corrupt(verdict));
        }
        let listed = self.list_all()?.len();
        debug!(nodes = listed, "store sanity check passed");
        Ok(())
    }
}

fn stored_node_from_row(row: &Row<'_>) -> rusqlite::Result<StoredNode> {
    Ok(StoredNode {
        node: Node {
            id: row.get(0)?,
            text: row.get(1)?,
            is_obsolete: row.get(2)?,
        },
        parent_id: row.get(3)?,
        level: row.get(4)?,
    })
}

fn walk_reaches(
    parents: &HashMap<NodeId, Option<NodeId>>,
    from: &NodeId,
    target: &NodeId,
    distance: i64,
) -> bool {
    if distance < 0 {
        return false;
    }
    let mut current = from;
    for _ in 0..distance {
        match parents.get(current) {
            Some(Some(parent)) => current = parent,
            _ => return false,
        }
    }
    current == target
}

fn node_exists_on(conn: &Connection, id: &NodeId) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM nodes WHERE id = ?1)",
        params![id],
        |row| row.get(0),
    )
}

fn insert_node_on(conn: &Connection, node: &NewNode) -> Result<(), StoreError> {
    if node_exists_on(conn, &node.id)? {
        return Err(StoreError::Conflict(node.id.clone()));
    }
    if let Some(parent) = &node.parent_id
        && !node_exists_on(conn, parent)?
    {
        return Err(StoreError::NotFound(parent.clone()));
    }

    conn.execute(
        "INSERT INTO nodes (id, text, is_obsolete) VALUES (?1, ?2, 0)",
        params![node.id, node.text],
    )?;
    conn.execute(
        "INSERT INTO closure (ancestor_id, descendant_id, parent_id, level, distance)
         SELECT ancestor_id, ?1, ?2, ?3, distance + 1
         FROM closure
         WHERE descendant_id = ?2
         UNION ALL
         SELECT ?1, ?1, ?2, ?3, 0",
        params![node.id, node.parent_id, node.level],
    )?;
    debug!(id = %node.id, parent = ?node.parent_id, level = node.level, "node inserted");
    Ok(())
}

fn update_text_on(conn: &Connection, id: &NodeId, text: &str) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE nodes SET text = ?2 WHERE id = ?1",
        params![id, text],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(id.clone()));
    }
    debug!(id = %id, "node text updated");
    Ok(())
}

fn soft_delete_on(conn: &Connection, id: &NodeId) -> Result<usize, StoreError> {
    if !node_exists_on(conn, id)? {
        return Err(StoreError::NotFound(id.clone()));
    }
    let marked = conn.execute(
        "UPDATE nodes SET is_obsolete = 1
         WHERE is_obsolete = 0
           AND (id = ?1 OR id IN (SELECT descendant_id FROM closure WHERE ancestor_id = ?1))",
        params![id],
    )?;
    debug!(id = %id, marked, "subtree soft-deleted");
    Ok(marked)
}

fn apply_batch_on(conn: &Connection, batch: &SyncBatch) -> Result<(), StoreError> {
    let mut inserts: Vec<&NewNode> = batch.inserts.iter().collect();
    inserts.sort_by_key(|node| node.level);
    for node in inserts {
        insert_node_on(conn, node)?;
    }
    for update in &batch.updates {
        update_text_on(conn, &update.id, &update.text)?;
    }
    for id in &batch.deletions {
        soft_delete_on(conn, id)?;
    }
    Ok(())
}

fn put_meta_on(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}
