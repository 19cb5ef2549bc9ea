//! Builds nested trees out of the flat, level-ordered rows that the store
//! and the cache hand out.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::cache::CachedRow;
use crate::store::{NodeId, StoredNode};

/// What tree assembly needs from a row.
pub trait TreeRow {
    fn id(&self) -> &NodeId;
    fn parent_id(&self) -> Option<&NodeId>;
    fn text(&self) -> &str;
    fn is_obsolete(&self) -> bool;
}

impl TreeRow for StoredNode {
    fn id(&self) -> &NodeId {
        &self.node.id
    }

    fn parent_id(&self) -> Option<&NodeId> {
        self.parent_id.as_ref()
    }

    fn text(&self) -> &str {
        &self.node.text
    }

    fn is_obsolete(&self) -> bool {
        self.node.is_obsolete
    }
}

impl TreeRow for CachedRow {
    fn id(&self) -> &NodeId {
        CachedRow::id(self)
    }

    fn parent_id(&self) -> Option<&NodeId> {
        CachedRow::parent_id(self)
    }

    fn text(&self) -> &str {
        CachedRow::text(self)
    }

    fn is_obsolete(&self) -> bool {
        CachedRow::is_obsolete(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeItem {
    pub id: NodeId,
    pub text: String,
    /// Obsolete items are shown but cannot be acted on.
    pub disabled: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeItem>,
}

/// Nests rows under their parents in input order. A row whose parent has not
/// appeared yet, or never appears, is attached to the top level instead of
/// being dropped.
pub fn assemble<'a, R, I>(rows: I) -> Vec<TreeItem>
where
    R: TreeRow + 'a,
    I: IntoIterator<Item = &'a R>,
{
    struct Slot {
        item: TreeItem,
        children: Vec<usize>,
    }

    let mut slots: Vec<Slot> = Vec::new();
    let mut index: HashMap<NodeId, usize> = HashMap::new();
    let mut roots: Vec<usize> = Vec::new();

    for row in rows {
        let slot = slots.len();
        slots.push(Slot {
            item: TreeItem {
                id: row.id().clone(),
                text: row.text().to_string(),
                disabled: row.is_obsolete(),
                children: Vec::new(),
            },
            children: Vec::new(),
        });
        match row.parent_id().and_then(|parent| index.get(parent)) {
            Some(&parent) => slots[parent].children.push(slot),
            None => roots.push(slot),
        }
        index.insert(row.id().clone(), slot);
    }

    fn build(slots: &mut [Option<Slot>], at: usize) -> Option<TreeItem> {
        let Slot { mut item, children } = slots[at].take()?;
        item.children = children
            .into_iter()
            .filter_map(|child| build(slots, child))
            .collect();
        Some(item)
    }

    let mut slots: Vec<Option<Slot>> = slots.into_iter().map(Some).collect();
    roots
        .into_iter()
        .filter_map(|root| build(&mut slots, root))
        .collect()
}

/// Indented text view; disabled items carry an `[obsolete]` marker.
pub fn render(items: &[TreeItem]) -> String {
    fn walk(out: &mut String, item: &TreeItem, depth: usize) {
        let marker = if item.disabled { " [obsolete]" } else { "" };
        let _ = writeln!(
            out,
            "{:indent$}{} ({}){marker}",
            "",
            item.text,
            item.id,
            indent = depth * 2
        );
        for child in &item.children {
            walk(out, child, depth + 1);
        }
    }

    let mut out = String::new();
    for item in items {
        walk(&mut out, item, 0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Node;

    fn row(id: &str, parent: Option<&str>, obsolete: bool) -> StoredNode {
        StoredNode {
            node: Node {
                id: NodeId::from(id),
                text: id.to_uppercase(),
                is_obsolete: obsolete,
            },
            parent_id: parent.map(NodeId::from),
            level: 0,
        }
    }

    #[test]
    fn nests_children_under_parents() {
        let rows = vec![
            row("w", None, false),
            row("e", Some("w"), false),
            row("a", Some("w"), true),
            row("f", Some("e"), false),
        ];
        let forest = assemble(&rows);
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].children.len(), 2);
        assert_eq!(forest[0].children[0].children[0].id, NodeId::from("f"));
        assert!(forest[0].children[1].disabled);
    }

    #[test]
    fn row_with_unseen_parent_falls_back_to_top_level() {
        // "late" names a parent listed after it; "orphan" names one that is
        // never listed.
        let rows = vec![
            row("w", None, false),
            row("late", Some("p"), false),
            row("p", Some("w"), false),
            row("orphan", Some("gone"), false),
        ];
        let forest = assemble(&rows);
        let top: Vec<&str> = forest.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(top, vec!["w", "late", "orphan"]);
        assert_eq!(forest[0].children[0].id, NodeId::from("p"));
        assert!(forest[0].children[0].children.is_empty());
    }

    #[test]
    fn render_indents_and_marks_obsolete() {
        let rows = vec![row("w", None, false), row("e", Some("w"), true)];
        let text = render(&assemble(&rows));
        assert_eq!(text, "W (w)\n  E (e) [obsolete]\n");
    }
}
