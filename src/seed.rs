//! Bulk-load format: two delimited tables mirroring the closure edges and the
//! node rows.
//!
//! ```text
//! ancestor;descendant;nearest_ancestor;level
//! 1;1;;0
//! 1;2;1;1
//! 2;2;1;1
//! ```
//!
//! ```text
//! id;text;is_obsolete
//! 1;World;0
//! 2;Europe;0
//! ```
//!
//! Ancestry is already fully materialized in these tables, so loading them
//! bypasses closure propagation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::store::atomic::atomic_write_with;
use crate::store::{ClosureEdge, Node, NodeId};

pub const DEFAULT_DELIMITER: u8 = b';';

const TREE_HEADER: [&str; 4] = ["ancestor", "descendant", "nearest_ancestor", "level"];
const NODES_HEADER: [&str; 3] = ["id", "text", "is_obsolete"];

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("cannot access `{}`: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("`{}`: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("`{}` line {line}: missing column `{column}`", .path.display())]
    Missing {
        path: PathBuf,
        line: u64,
        column: &'static str,
    },
    #[error("`{}` line {line}: level `{value}` is not a non-negative integer", .path.display())]
    InvalidLevel {
        path: PathBuf,
        line: u64,
        value: String,
    },
    #[error("`{}` line {line}: `{value}` is not a boolean flag", .path.display())]
    InvalidFlag {
        path: PathBuf,
        line: u64,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPaths {
    pub tree_paths: PathBuf,
    pub nodes: PathBuf,
    pub delimiter: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedEdge {
    pub ancestor_id: NodeId,
    pub descendant_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub level: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedData {
    pub edges: Vec<SeedEdge>,
    pub nodes: Vec<Node>,
    /// Hex SHA-256 over both source tables.
    pub digest: String,
}

pub fn read_seed(paths: &SeedPaths) -> Result<SeedData, SeedError> {
    let tree_bytes = read_bytes(&paths.tree_paths)?;
    let node_bytes = read_bytes(&paths.nodes)?;
    let edges = parse_edges(&paths.tree_paths, &tree_bytes, paths.delimiter)?;
    let nodes = parse_nodes(&paths.nodes, &node_bytes, paths.delimiter)?;
    Ok(SeedData {
        edges,
        nodes,
        digest: seed_digest(&tree_bytes, &node_bytes),
    })
}

/// Writes the store back out in the bulk-load format. Each file is replaced
/// atomically.
pub fn write_seed(
    paths: &SeedPaths,
    edges: &[ClosureEdge],
    nodes: &[Node],
) -> Result<(), SeedError> {
    write_table(&paths.tree_paths, paths.delimiter, &TREE_HEADER, |writer| {
        for edge in edges {
            let level = edge.level.to_string();
            writer.write_record([
                edge.ancestor_id.as_str(),
                edge.descendant_id.as_str(),
                edge.parent_id.as_ref().map(NodeId::as_str).unwrap_or(""),
                level.as_str(),
            ])?;
        }
        Ok(())
    })?;
    write_table(&paths.nodes, paths.delimiter, &NODES_HEADER, |writer| {
        for node in nodes {
            writer.write_record([
                node.id.as_str(),
                node.text.as_str(),
                if node.is_obsolete { "1" } else { "0" },
            ])?;
        }
        Ok(())
    })
}

fn write_table<F>(path: &Path, delimiter: u8, header: &[&str], rows: F) -> Result<(), SeedError>
where
    F: FnOnce(&mut csv::Writer<&mut fs::File>) -> csv::Result<()>,
{
    atomic_write_with(path, |file| {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(file);
        writer.write_record(header).map_err(io::Error::other)?;
        rows(&mut writer).map_err(io::Error::other)?;
        writer.flush()
    })
    .map_err(|source| SeedError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, SeedError> {
    fs::read(path).map_err(|source| SeedError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn reader(bytes: &[u8], delimiter: u8) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(bytes)
}

fn parse_edges(path: &Path, bytes: &[u8], delimiter: u8) -> Result<Vec<SeedEdge>, SeedError> {
    let mut out = Vec::new();
    for record in reader(bytes, delimiter).records() {
        let record = record.map_err(|source| SeedError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let line = record.position().map(csv::Position::line).unwrap_or(0);
        let field = |idx: usize| {
            record.get(idx).ok_or(SeedError::Missing {
                path: path.to_path_buf(),
                line,
                column: TREE_HEADER[idx],
            })
        };
        let raw_level = field(3)?.trim();
        let level = raw_level
            .parse::<u32>()
            .map_err(|_| SeedError::InvalidLevel {
                path: path.to_path_buf(),
                line,
                value: raw_level.to_string(),
            })?;
        let parent = field(2)?;
        out.push(SeedEdge {
            ancestor_id: NodeId::from(field(0)?),
            descendant_id: NodeId::from(field(1)?),
            parent_id: (!parent.is_empty()).then(|| NodeId::from(parent)),
            level,
        });
    }
    Ok(out)
}

fn parse_nodes(path: &Path, bytes: &[u8], delimiter: u8) -> Result<Vec<Node>, SeedError> {
    let mut out = Vec::new();
    for record in reader(bytes, delimiter).records() {
        let record = record.map_err(|source| SeedError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let line = record.position().map(csv::Position::line).unwrap_or(0);
        let field = |idx: usize| {
            record.get(idx).ok_or(SeedError::Missing {
                path: path.to_path_buf(),
                line,
                column: NODES_HEADER[idx],
            })
        };
        let raw_flag = field(2)?.trim();
        let is_obsolete = parse_flag(raw_flag).ok_or_else(|| SeedError::InvalidFlag {
            path: path.to_path_buf(),
            line,
            value: raw_flag.to_string(),
        })?;
        out.push(Node {
            id: NodeId::from(field(0)?),
            text: field(1)?.to_string(),
            is_obsolete,
        });
    }
    Ok(out)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "0" | "false" | "no" => Some(false),
        "1" | "true" | "yes" => Some(true),
        _ => None,
    }
}

fn seed_digest(tree: &[u8], nodes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tree);
    hasher.update([0u8]);
    hasher.update(nodes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}
