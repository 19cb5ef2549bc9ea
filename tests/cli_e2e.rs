use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use serde_json::Value;

const TREE_PATHS: &str = "ancestor;descendant;nearest_ancestor;level
1;1;;0
1;2;1;1
2;2;1;1
1;3;2;2
2;3;2;2
3;3;2;2
1;4;1;1
4;4;1;1
";

const NODES: &str = "id;text;is_obsolete
1;World;0
2;Europe;0
3;France;0
4;Asia;0
";

fn run_cli(repo: &Path, args: &[&str], stdin: Option<&str>) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_treecache"));
    cmd.current_dir(repo)
        .args(args)
        .env("HOME", repo.join("home"))
        .env_remove("RUST_LOG");
    if stdin.is_none() {
        return cmd.output().expect("command runs");
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().expect("command spawns");
    {
        let mut pipe = child.stdin.take().expect("stdin pipe");
        pipe.write_all(stdin.expect("stdin content").as_bytes())
            .expect("stdin write");
    }
    child.wait_with_output().expect("command output")
}

fn run_json(repo: &Path, args: &[&str], stdin: Option<&str>) -> Value {
    let output = run_cli(repo, args, stdin);
    assert!(
        output.status.success(),
        "command failed: args={args:?}\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("json stdout")
}

fn run_session(repo: &Path, script: &str) -> Vec<Value> {
    let output = run_cli(repo, &["session"], Some(script));
    assert!(
        output.status.success(),
        "session failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout)
        .expect("utf8 stdout")
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect()
}

fn error_code(output: &Output) -> String {
    let payload: Value = serde_json::from_slice(&output.stderr).expect("json stderr");
    payload["error"]["code"]
        .as_str()
        .expect("error code")
        .to_string()
}

fn seeded_repo(repo: &Path) {
    fs::create_dir_all(repo.join(".treecache")).expect("treecache dir");
    fs::create_dir_all(repo.join("data")).expect("data dir");
    fs::write(repo.join("data/tree_paths.csv"), TREE_PATHS).expect("tree paths");
    fs::write(repo.join("data/nodes.csv"), NODES).expect("nodes");
    fs::write(
        repo.join(".treecache/config.yml"),
        "seed:\n  tree_paths: data/tree_paths.csv\n  nodes: data/nodes.csv\n",
    )
    .expect("config");
}

#[test]
fn init_seeds_store_and_tree_lists_it() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    seeded_repo(repo);

    let init = run_json(repo, &["init"], None);
    assert_eq!(init["status"], "ok");
    assert_eq!(init["seeded"], true);
    assert_eq!(init["nodes"], 4);

    let again = run_json(repo, &["init"], None);
    assert_eq!(again["seeded"], false, "populated store is not reseeded");

    let tree = run_json(repo, &["tree"], None);
    assert_eq!(tree["tree"][0]["id"], "1");
    let children: Vec<&str> = tree["tree"][0]["children"]
        .as_array()
        .expect("children")
        .iter()
        .map(|item| item["id"].as_str().expect("id"))
        .collect();
    assert_eq!(children, vec!["2", "4"]);

    let text = run_cli(repo, &["tree", "--text"], None);
    assert!(text.status.success());
    assert_eq!(
        String::from_utf8_lossy(&text.stdout),
        "World (1)\n  Europe (2)\n    France (3)\n  Asia (4)\n"
    );

    let status = run_json(repo, &["status"], None);
    assert_eq!(status["nodes"], 4);
    assert_eq!(status["edges"], 8);
    assert_eq!(status["closure_ok"], true);
    assert_eq!(status["seed_digest"].as_str().map(str::len), Some(64));
}

#[test]
fn default_config_is_written_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();

    let init = run_json(repo, &["init"], None);
    assert_eq!(init["seeded"], false);
    assert_eq!(init["nodes"], 0);
    let written = fs::read_to_string(repo.join(".treecache/config.yml")).expect("config");
    assert!(written.contains("busy_timeout_ms"));
    assert!(repo.join(".treecache/tree.sqlite").exists());
}

#[test]
fn session_create_is_visible_to_later_commands() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    seeded_repo(repo);
    run_json(repo, &["init"], None);

    let docs = run_session(repo, "checkout 1\nadd 1 Africa\napply\nquit\n");
    assert_eq!(docs.len(), 4);
    let new_id = docs[1]["id"].as_str().expect("new id").to_string();
    assert_eq!(docs[1]["row"]["state"], "new");
    assert_eq!(docs[2]["inserted"], 1);
    assert_eq!(docs[2]["obsolete"], serde_json::json!([]));

    let node = run_json(repo, &["get", &new_id], None);
    assert_eq!(node["text"], "Africa");
    assert_eq!(node["parent_id"], "1");
    assert_eq!(node["level"], 1);
    assert_eq!(node["is_obsolete"], false);
}

#[test]
fn session_delete_cascades_and_errors_do_not_end_it() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    seeded_repo(repo);
    run_json(repo, &["init"], None);

    let docs = run_session(
        repo,
        "checkout 2\ncheckout 3\nedit 42 nothing\ndelete 2\napply\nstore\n",
    );
    assert_eq!(docs[2]["error"]["code"], "not_found");
    assert_eq!(docs[2]["line"], 3);
    assert_eq!(docs[4]["deleted"], 1);
    assert_eq!(docs[4]["obsolete"], serde_json::json!(["2", "3"]));
    assert_eq!(docs[5]["tree"][0]["children"][0]["disabled"], true);

    let text = run_cli(repo, &["tree", "--text"], None);
    assert_eq!(
        String::from_utf8_lossy(&text.stdout),
        "World (1)\n  Europe (2) [obsolete]\n    France (3) [obsolete]\n  Asia (4)\n"
    );
}

#[test]
fn export_writes_bulk_load_tables_and_reset_restores_seed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    seeded_repo(repo);
    run_json(repo, &["init"], None);

    run_session(repo, "checkout 2\nedit 2 Europa\napply\n");
    assert_eq!(run_json(repo, &["get", "2"], None)["text"], "Europa");

    let export = run_json(
        repo,
        &[
            "export",
            "--tree-paths",
            "out/tree_paths.csv",
            "--nodes",
            "out/nodes.csv",
        ],
        None,
    );
    assert_eq!(export["edges"], 8);
    assert_eq!(export["nodes"], 4);
    let nodes = fs::read_to_string(repo.join("out/nodes.csv")).expect("exported nodes");
    assert!(nodes.starts_with("id;text;is_obsolete\n"));
    assert!(nodes.contains("2;Europa;0"));
    let tree = fs::read_to_string(repo.join("out/tree_paths.csv")).expect("exported tree");
    assert!(tree.contains("1;3;2;2"));

    let reset = run_json(repo, &["reset"], None);
    assert_eq!(reset["nodes"], 4);
    assert_eq!(run_json(repo, &["get", "2"], None)["text"], "Europe");
}

#[test]
fn garbage_store_file_is_rebuilt_on_open() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    seeded_repo(repo);
    run_json(repo, &["init"], None);

    fs::write(repo.join(".treecache/tree.sqlite"), b"definitely not sqlite").expect("clobber");
    let _ = fs::remove_file(repo.join(".treecache/tree.sqlite-wal"));
    let _ = fs::remove_file(repo.join(".treecache/tree.sqlite-shm"));

    let status = run_json(repo, &["status"], None);
    assert_eq!(status["nodes"], 4);
    assert_eq!(status["closure_ok"], true);
}

#[test]
fn failures_report_stable_codes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();

    let missing_store = run_cli(repo, &["tree"], None);
    assert!(!missing_store.status.success());
    assert_eq!(error_code(&missing_store), "not_initialized");

    seeded_repo(repo);
    run_json(repo, &["init"], None);
    let missing_node = run_cli(repo, &["get", "nope"], None);
    assert!(!missing_node.status.success());
    assert_eq!(error_code(&missing_node), "not_found");

    fs::write(repo.join(".treecache/config.yml"), "seed:\n  nodes: only.csv\n").expect("config");
    let bad_config = run_cli(repo, &["status"], None);
    assert_eq!(error_code(&bad_config), "config_error");
}

#[test]
fn session_reset_reloads_store_from_seed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = temp.path();
    seeded_repo(repo);
    run_json(repo, &["init"], None);

    let docs = run_session(repo, "checkout 4\nedit 4 Asien\napply\nreset\nshow\n");
    assert_eq!(docs[3]["store_reseeded"], true);
    assert_eq!(docs[4]["rows"], serde_json::json!([]));
    assert_eq!(run_json(repo, &["get", "4"], None)["text"], "Asia");
}
