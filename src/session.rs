//! Line-oriented driver for a working cache, standing in for an interactive
//! two-pane editor: one command per input line, one JSON document per output
//! line.
//!
//! ```text
//! checkout <id>          pull a stored node into the cache
//! add <parent> <text>    create a child in the cache
//! edit <id> <text>       change a cached row's text
//! delete <id>            mark a cached row obsolete
//! apply                  push the cache to the store
//! show                   the cache as a tree
//! store                  the store as a tree
//! get <id>               one cached row
//! reset                  reload the store from seed, drop every cached row
//! quit                   stop reading input
//! ```

use std::io::{self, BufRead, Write};

use serde_json::{Value, json};
use tracing::debug;

use crate::cache::{CacheError, CachedRow, PushReport, WorkingCache};
use crate::seed::{SeedPaths, read_seed};
use crate::store::{NodeId, StoreError, TreeStore};
use crate::tree::assemble;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Checkout(NodeId),
    Add { parent: NodeId, text: String },
    Edit { id: NodeId, text: String },
    Delete(NodeId),
    Apply,
    Show,
    Store,
    Get(NodeId),
    Reset,
    Quit,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("`{command}` needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownCommand(_) => "unknown_command",
            Self::MissingArgument { .. } => "missing_argument",
            Self::Cache(err) => err.code(),
            Self::Store(err) => err.code(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSummary {
    pub commands: usize,
    pub errors: usize,
    /// Rows still unsynced when the session ended.
    pub pending: usize,
}

/// Parses one input line. Blank lines and `#` comments yield `None`.
pub fn parse_command(line: &str) -> Result<Option<SessionCommand>, SessionError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (verb, rest) = split_word(line);
    let command = match verb {
        "checkout" => SessionCommand::Checkout(require_id("checkout", rest)?),
        "add" => {
            let (parent, text) = split_word(rest);
            SessionCommand::Add {
                parent: require_id("add", parent)?,
                text: require_text("add", text)?,
            }
        }
        "edit" => {
            let (id, text) = split_word(rest);
            SessionCommand::Edit {
                id: require_id("edit", id)?,
                text: require_text("edit", text)?,
            }
        }
        "delete" => SessionCommand::Delete(require_id("delete", rest)?),
        "apply" => SessionCommand::Apply,
        "show" => SessionCommand::Show,
        "store" => SessionCommand::Store,
        "get" => SessionCommand::Get(require_id("get", rest)?),
        "reset" => SessionCommand::Reset,
        "quit" | "exit" => SessionCommand::Quit,
        other => return Err(SessionError::UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (input, ""),
    }
}

fn require_id(command: &'static str, raw: &str) -> Result<NodeId, SessionError> {
    let raw = raw.trim();
    if raw.is_empty() || raw.contains(char::is_whitespace) {
        return Err(SessionError::MissingArgument {
            command,
            argument: "a single node id",
        });
    }
    Ok(NodeId::from(raw))
}

fn require_text(command: &'static str, raw: &str) -> Result<String, SessionError> {
    if raw.is_empty() {
        return Err(SessionError::MissingArgument {
            command,
            argument: "text",
        });
    }
    Ok(raw.to_string())
}

pub struct Session<'s> {
    store: &'s TreeStore,
    cache: WorkingCache,
    root_id: Option<NodeId>,
    seed: Option<SeedPaths>,
}

impl<'s> Session<'s> {
    pub fn new(store: &'s TreeStore, root_id: Option<NodeId>) -> Self {
        Self {
            store,
            cache: WorkingCache::new(),
            root_id,
            seed: None,
        }
    }

    /// Seed tables that `reset` reloads the store from.
    pub fn with_seed(mut self, seed: Option<SeedPaths>) -> Self {
        self.seed = seed;
        self
    }

    pub fn cache(&self) -> &WorkingCache {
        &self.cache
    }

    pub fn execute(&mut self, command: SessionCommand) -> Result<Value, SessionError> {
        debug!(?command, "session command");
        match command {
            SessionCommand::Checkout(id) => {
                let row = self.cache.checkout(self.store, &id)?;
                Ok(json!({ "status": "ok", "row": row_to_json(row) }))
            }
            SessionCommand::Add { parent, text } => {
                let id = self.cache.create(&parent, text)?;
                let row = self.cache.get(&id)?;
                Ok(json!({ "status": "ok", "id": id, "row": row_to_json(row) }))
            }
            SessionCommand::Edit { id, text } => {
                self.cache.edit(&id, text)?;
                Ok(json!({ "status": "ok", "row": row_to_json(self.cache.get(&id)?) }))
            }
            SessionCommand::Delete(id) => {
                self.cache.delete(&id)?;
                Ok(json!({ "status": "ok", "row": row_to_json(self.cache.get(&id)?) }))
            }
            SessionCommand::Apply => {
                let report = self.cache.push_to_store(self.store)?;
                Ok(report_to_json(&report))
            }
            SessionCommand::Show => {
                let snapshot = self.cache.snapshot();
                let rows: Vec<Value> = snapshot.iter().map(row_to_json).collect();
                Ok(json!({
                    "rows": rows,
                    "tree": assemble(snapshot.iter()),
                    "pending": self.cache.dirty_count(),
                }))
            }
            SessionCommand::Store => {
                let rows = match &self.root_id {
                    Some(root) => self.store.list_subtree(root)?,
                    None => self.store.list_all()?,
                };
                Ok(json!({ "root_id": self.root_id, "tree": assemble(&rows) }))
            }
            SessionCommand::Get(id) => Ok(json!({ "row": row_to_json(self.cache.get(&id)?) })),
            SessionCommand::Reset => {
                // The store is reseeded first so a failed reload keeps the cache.
                let reseeded = match &self.seed {
                    Some(paths) => {
                        let seed = read_seed(paths).map_err(StoreError::from)?;
                        self.store.seed(&seed)?;
                        true
                    }
                    None => false,
                };
                self.cache.reset();
                Ok(json!({ "status": "ok", "store_reseeded": reseeded }))
            }
            SessionCommand::Quit => Ok(json!({ "status": "bye" })),
        }
    }

    /// Runs commands until `quit` or end of input. Command failures are
    /// written as error documents and do not end the session.
    pub fn run<R, W>(&mut self, input: R, mut output: W) -> io::Result<SessionSummary>
    where
        R: BufRead,
        W: Write,
    {
        let mut summary = SessionSummary::default();
        for (idx, line) in input.lines().enumerate() {
            let line = line?;
            let outcome = match parse_command(&line) {
                Ok(None) => continue,
                Ok(Some(command)) => {
                    let quit = command == SessionCommand::Quit;
                    summary.commands += 1;
                    let result = self.execute(command);
                    if quit {
                        write_line(&mut output, &result.unwrap_or(Value::Null))?;
                        break;
                    }
                    result
                }
                Err(err) => {
                    summary.commands += 1;
                    Err(err)
                }
            };
            let document = match outcome {
                Ok(value) => value,
                Err(err) => {
                    summary.errors += 1;
                    json!({
                        "error": { "code": err.code(), "message": err.to_string() },
                        "line": idx + 1,
                    })
                }
            };
            write_line(&mut output, &document)?;
        }
        summary.pending = self.cache.dirty_count();
        Ok(summary)
    }
}

fn write_line<W: Write>(output: &mut W, value: &Value) -> io::Result<()> {
    serde_json::to_writer(&mut *output, value)?;
    output.write_all(b"\n")?;
    output.flush()
}

pub fn row_to_json(row: &CachedRow) -> Value {
    json!({
        "id": row.id(),
        "parent_id": row.parent_id(),
        "text": row.text(),
        "level": row.level(),
        "is_obsolete": row.is_obsolete(),
        "state": row.state(),
        "is_new": row.is_new(),
        "is_synced": row.is_synced(),
        "last_modified_at": row.last_modified_at().to_rfc3339(),
        "last_synced_at": row.last_synced_at().map(|at| at.to_rfc3339()),
    })
}

pub fn report_to_json(report: &PushReport) -> Value {
    json!({
        "status": "ok",
        "inserted": report.inserted,
        "updated": report.updated,
        "deleted": report.deleted,
        "obsolete": report.obsolete,
        "synced_at": report.synced_at.to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewNode;

    fn store() -> TreeStore {
        let store = TreeStore::open_in_memory().expect("in-memory sqlite");
        store
            .insert_node(&NewNode {
                id: NodeId::from("1"),
                parent_id: None,
                text: "World".to_string(),
                level: 0,
            })
            .expect("root");
        store
            .insert_node(&NewNode {
                id: NodeId::from("2"),
                parent_id: Some(NodeId::from("1")),
                text: "Europe".to_string(),
                level: 1,
            })
            .expect("child");
        store
    }

    fn run_script(session: &mut Session<'_>, script: &str) -> (Vec<Value>, SessionSummary) {
        let mut out = Vec::new();
        let summary = session.run(script.as_bytes(), &mut out).expect("session io");
        let docs = String::from_utf8(out)
            .expect("utf8")
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        (docs, summary)
    }

    #[test]
    fn parses_commands_with_free_text() {
        assert_eq!(
            parse_command("  add 1   New  Zealand ").expect("parse"),
            Some(SessionCommand::Add {
                parent: NodeId::from("1"),
                text: "New  Zealand".to_string(),
            })
        );
        assert_eq!(parse_command("# note").expect("comment"), None);
        assert_eq!(parse_command("").expect("blank"), None);
        assert!(matches!(
            parse_command("edit 2"),
            Err(SessionError::MissingArgument { command: "edit", .. })
        ));
        assert!(matches!(
            parse_command("delete a b"),
            Err(SessionError::MissingArgument { .. })
        ));
        assert!(matches!(
            parse_command("frobnicate"),
            Err(SessionError::UnknownCommand(_))
        ));
    }

    #[test]
    fn script_checks_out_edits_and_applies() {
        let store = store();
        let mut session = Session::new(&store, Some(NodeId::from("1")));
        let (docs, summary) = run_script(
            &mut session,
            "checkout 1\ncheckout 2\nedit 2 Europa\nadd 2 France\napply\nshow\nquit\nget 1\n",
        );

        assert_eq!(summary.commands, 7, "nothing after quit runs");
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.pending, 0);
        assert_eq!(docs[2]["row"]["state"], "dirty");
        assert_eq!(docs[3]["row"]["level"], 2);
        assert_eq!(docs[4]["inserted"], 1);
        assert_eq!(docs[4]["updated"], 1);
        assert_eq!(docs[5]["tree"][0]["children"][0]["text"], "Europa");
        assert_eq!(docs[6]["status"], "bye");

        assert_eq!(
            store.get_node(&NodeId::from("2")).expect("stored").node.text,
            "Europa"
        );
        assert_eq!(store.list_subtree(&NodeId::from("1")).expect("tree").len(), 3);
    }

    #[test]
    fn errors_are_reported_per_line_and_session_continues() {
        let store = store();
        let mut session = Session::new(&store, None);
        let (docs, summary) = run_script(&mut session, "edit 9 x\nbogus\ncheckout 9\ncheckout 1\n");

        assert_eq!(summary.errors, 3);
        assert_eq!(docs[0]["error"]["code"], "not_found");
        assert_eq!(docs[0]["line"], 1);
        assert_eq!(docs[1]["error"]["code"], "unknown_command");
        assert_eq!(docs[2]["error"]["code"], "not_found");
        assert_eq!(docs[3]["status"], "ok");
        assert_eq!(session.cache().len(), 1);
    }

    #[test]
    fn delete_then_apply_reports_cascade() {
        let store = store();
        let mut session = Session::new(&store, None);
        let (docs, _) = run_script(&mut session, "checkout 1\ncheckout 2\ndelete 1\napply\nstore\n");

        assert_eq!(docs[3]["obsolete"], json!(["1", "2"]));
        assert_eq!(docs[4]["tree"][0]["disabled"], true);
        assert_eq!(docs[4]["tree"][0]["children"][0]["disabled"], true);
    }

    #[test]
    fn reset_reseeds_store_and_clears_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = SeedPaths {
            tree_paths: dir.path().join("tree_paths.csv"),
            nodes: dir.path().join("nodes.csv"),
            delimiter: crate::seed::DEFAULT_DELIMITER,
        };
        std::fs::write(
            &paths.tree_paths,
            "ancestor;descendant;nearest_ancestor;level\n1;1;;0\n1;2;1;1\n2;2;1;1\n",
        )
        .expect("tree paths");
        std::fs::write(&paths.nodes, "id;text;is_obsolete\n1;World;0\n2;Europe;0\n")
            .expect("nodes");

        let store = store();
        let mut session = Session::new(&store, None).with_seed(Some(paths));
        let (docs, summary) = run_script(
            &mut session,
            "checkout 1\nadd 1 Asia\napply\ncheckout 2\nedit 2 Europa\nreset\n",
        );

        assert_eq!(summary.errors, 0);
        assert_eq!(docs[5]["store_reseeded"], true);
        assert!(session.cache().is_empty());
        assert_eq!(summary.pending, 0);
        assert_eq!(store.list_all().expect("list").len(), 2);
        assert_eq!(
            store.get_node(&NodeId::from("2")).expect("node").node.text,
            "Europe"
        );
    }

    #[test]
    fn reset_without_seed_only_clears_cache() {
        let store = store();
        let mut session = Session::new(&store, None);
        let (docs, _) = run_script(&mut session, "checkout 1\nadd 1 Asia\napply\nreset\n");

        assert_eq!(docs[3]["store_reseeded"], false);
        assert!(session.cache().is_empty());
        assert_eq!(store.list_all().expect("list").len(), 3);
    }

    #[test]
    fn failed_reseed_keeps_the_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store();
        let mut session = Session::new(&store, None).with_seed(Some(SeedPaths {
            tree_paths: dir.path().join("absent.csv"),
            nodes: dir.path().join("absent-nodes.csv"),
            delimiter: crate::seed::DEFAULT_DELIMITER,
        }));
        let (docs, summary) = run_script(&mut session, "checkout 1\nreset\n");

        assert_eq!(docs[1]["error"]["code"], "seed_error");
        assert_eq!(summary.errors, 1);
        assert_eq!(session.cache().len(), 1);
    }
}
