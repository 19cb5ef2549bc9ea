use std::fs;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tracing::info;
use treecache::cache::CacheError;
use treecache::config::{
    ConfigError, EffectiveConfig, default_repo_config_yaml, load_effective_config,
    parse_delimiter,
};
use treecache::seed::{SeedError, SeedPaths, read_seed, write_seed};
use treecache::session::Session;
use treecache::store::atomic::atomic_write;
use treecache::store::{FatalError, NodeId, StoreError, TreeStore, open_with_report};
use treecache::telemetry;
use treecache::tree::{assemble, render};

const TREECACHE_DIR: &str = ".treecache";
const CONFIG_FILE: &str = "config.yml";

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(code: &'static str, err: io::Error) -> Self {
        Self::new(code, err.to_string())
    }
}

impl From<StoreError> for CliError {
    fn from(value: StoreError) -> Self {
        Self::new(value.code(), value.to_string())
    }
}

impl From<FatalError> for CliError {
    fn from(value: FatalError) -> Self {
        Self::new("store_fatal", value.to_string())
    }
}

impl From<CacheError> for CliError {
    fn from(value: CacheError) -> Self {
        Self::new(value.code(), value.to_string())
    }
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        Self::new("config_error", value.to_string())
    }
}

impl From<SeedError> for CliError {
    fn from(value: SeedError) -> Self {
        Self::new("seed_error", value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "treecache")]
#[command(about = "Closure-table tree store with a working cache")]
struct Cli {
    /// Repo config file to use instead of `.treecache/config.yml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Store database to use instead of the configured one.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init,
    Status,
    Tree(TreeArgs),
    Get(GetArgs),
    Reset,
    Export(ExportArgs),
    Session,
}

#[derive(Args, Debug)]
struct TreeArgs {
    #[arg(long)]
    root: Option<String>,
    #[arg(long)]
    text: bool,
}

#[derive(Args, Debug)]
struct GetArgs {
    id: String,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[arg(long)]
    tree_paths: PathBuf,
    #[arg(long)]
    nodes: PathBuf,
    #[arg(long, default_value = ";")]
    delimiter: String,
}

#[derive(Debug, Clone)]
struct RepoPaths {
    root: PathBuf,
    repo_config: PathBuf,
    user_config: PathBuf,
}

fn main() -> ExitCode {
    let _ = telemetry::init_stderr_subscriber();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().map_err(|err| CliError::io("cwd_error", err))?;
    let home = home_dir()?;
    let paths = repo_paths(&cwd, &home, cli.config.as_deref());

    if let Command::Init = cli.command {
        write_default_config(&paths)?;
    }
    let mut config = load_effective_config(
        &cwd,
        &home,
        Some(&paths.repo_config),
        Some(&paths.user_config),
    )?;
    if let Some(db) = cli.db {
        config.store_path = if db.is_absolute() { db } else { cwd.join(db) };
    }

    match cli.command {
        Command::Init => cmd_init(&paths, &config),
        Command::Status => cmd_status(&config),
        Command::Tree(args) => cmd_tree(&config, args),
        Command::Get(args) => cmd_get(&config, args),
        Command::Reset => cmd_reset(&config),
        Command::Export(args) => cmd_export(&config, args),
        Command::Session => cmd_session(&config),
    }
}

fn cmd_init(paths: &RepoPaths, config: &EffectiveConfig) -> Result<(), CliError> {
    let (store, report) = open_with_report(&config.store_config())?;
    let meta = store.meta()?;
    print_json(&json!({
        "status": "ok",
        "treecache_dir": paths.root,
        "store": config.store_path,
        "seeded": report.seeded,
        "recovered_from": report.recovered_from,
        "nodes": meta.node_count,
    }))
}

fn cmd_status(config: &EffectiveConfig) -> Result<(), CliError> {
    let store = open_initialized(config)?;
    let meta = store.meta()?;
    let violations: Vec<String> = store
        .verify_closure()?
        .iter()
        .map(ToString::to_string)
        .collect();
    print_json(&json!({
        "store": config.store_path,
        "schema_version": meta.schema_version,
        "nodes": meta.node_count,
        "edges": meta.edge_count,
        "seed_digest": meta.seed_digest,
        "seeded_at": meta.seeded_at,
        "closure_ok": violations.is_empty(),
        "violations": violations,
    }))
}

fn cmd_tree(config: &EffectiveConfig, args: TreeArgs) -> Result<(), CliError> {
    let store = open_initialized(config)?;
    let root = args.root.map(NodeId::from).or_else(|| config.root_id.clone());
    let rows = match &root {
        Some(root) => store.list_subtree(root)?,
        None => store.list_all()?,
    };
    let forest = assemble(&rows);
    if args.text {
        print!("{}", render(&forest));
        return Ok(());
    }
    print_json(&json!({ "root_id": root, "tree": forest }))
}

fn cmd_get(config: &EffectiveConfig, args: GetArgs) -> Result<(), CliError> {
    let store = open_initialized(config)?;
    let node = store.get_node(&NodeId::from(args.id))?;
    print_json(&serde_json::to_value(&node)?)
}

fn cmd_reset(config: &EffectiveConfig) -> Result<(), CliError> {
    let seed_paths = config.seed.as_ref().ok_or_else(|| {
        CliError::new(
            "seed_not_configured",
            "no seed files configured; set `seed` in config.yml",
        )
    })?;
    let store = open_initialized(config)?;
    let seed = read_seed(seed_paths)?;
    store.seed(&seed)?;
    let meta = store.meta()?;
    info!(nodes = meta.node_count, "store reset from seed");
    print_json(&json!({
        "status": "ok",
        "nodes": meta.node_count,
        "edges": meta.edge_count,
        "seed_digest": seed.digest,
    }))
}

fn cmd_export(config: &EffectiveConfig, args: ExportArgs) -> Result<(), CliError> {
    let delimiter = parse_delimiter(&args.delimiter)?;
    let store = open_initialized(config)?;
    let edges = store.closure_edges()?;
    let nodes: Vec<_> = store.list_all()?.into_iter().map(|stored| stored.node).collect();
    let paths = SeedPaths {
        tree_paths: args.tree_paths,
        nodes: args.nodes,
        delimiter,
    };
    write_seed(&paths, &edges, &nodes)?;
    print_json(&json!({
        "status": "ok",
        "tree_paths": paths.tree_paths,
        "nodes_path": paths.nodes,
        "edges": edges.len(),
        "nodes": nodes.len(),
    }))
}

fn cmd_session(config: &EffectiveConfig) -> Result<(), CliError> {
    let store = open_initialized(config)?;
    let mut session =
        Session::new(&store, config.root_id.clone()).with_seed(config.seed.clone());
    let stdin = io::stdin();
    let stdout = io::stdout();
    let summary = session
        .run(stdin.lock(), BufWriter::new(stdout.lock()))
        .map_err(|err| CliError::io("io_error", err))?;
    info!(
        commands = summary.commands,
        errors = summary.errors,
        pending = summary.pending,
        "session finished"
    );
    Ok(())
}

fn open_initialized(config: &EffectiveConfig) -> Result<TreeStore, CliError> {
    if !config.store_path.exists() {
        return Err(CliError::new(
            "not_initialized",
            format!(
                "no store at `{}`; run `treecache init`",
                config.store_path.display()
            ),
        ));
    }
    let (store, report) = open_with_report(&config.store_config())?;
    if let Some(cause) = report.recovered_from {
        info!(%cause, "store was rebuilt from seed");
    }
    Ok(store)
}

fn repo_paths(cwd: &Path, home: &Path, config_override: Option<&Path>) -> RepoPaths {
    let root = cwd.join(TREECACHE_DIR);
    let repo_config = match config_override {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => cwd.join(path),
        None => root.join(CONFIG_FILE),
    };
    RepoPaths {
        repo_config,
        user_config: home.join(TREECACHE_DIR).join(CONFIG_FILE),
        root,
    }
}

fn write_default_config(paths: &RepoPaths) -> Result<(), CliError> {
    fs::create_dir_all(&paths.root).map_err(|err| CliError::io("mkdir_error", err))?;
    if paths.repo_config.exists() {
        return Ok(());
    }
    if let Some(parent) = paths.repo_config.parent() {
        fs::create_dir_all(parent).map_err(|err| CliError::io("mkdir_error", err))?;
    }
    atomic_write(&paths.repo_config, default_repo_config_yaml().as_bytes())
        .map_err(|err| CliError::io("write_error", err))
}

fn home_dir() -> Result<PathBuf, CliError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CliError::new("home_error", "HOME environment variable is not set"))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
