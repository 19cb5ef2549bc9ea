use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::seed::{DEFAULT_DELIMITER, SeedPaths};
use crate::store::{NodeId, StoreConfig};

pub const PROJECT_CONFIG_FILE: &str = ".treecache.project.yml";
const DEFAULT_STORE_PATH: &str = ".treecache/tree.sqlite";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveConfig {
    pub store_path: PathBuf,
    pub busy_timeout: Duration,
    pub seed: Option<SeedPaths>,
    /// Node shown as the top of the tree; the whole forest when unset.
    pub root_id: Option<NodeId>,
}

impl EffectiveConfig {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.store_path.clone(),
            seed: self.seed.clone(),
            busy_timeout: self.busy_timeout,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    store: Option<RawStore>,
    #[serde(default)]
    seed: Option<RawSeed>,
    #[serde(default)]
    root_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStore {
    path: Option<String>,
    busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSeed {
    tree_paths: Option<String>,
    nodes: Option<String>,
    delimiter: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read `{}`: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("`{}`: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("seed delimiter must be a single ASCII character, got `{0}`")]
    InvalidDelimiter(String),
    #[error("seed config needs both `tree_paths` and `nodes`")]
    IncompleteSeed,
}

/// Field-wise overlay; later layers win.
#[derive(Debug, Default)]
struct Layered {
    store_path: Option<String>,
    busy_timeout_ms: Option<u64>,
    tree_paths: Option<String>,
    nodes: Option<String>,
    delimiter: Option<String>,
    root_id: Option<String>,
}

impl Layered {
    fn apply(&mut self, raw: RawConfig) {
        if let Some(store) = raw.store {
            overlay(&mut self.store_path, store.path);
            overlay(&mut self.busy_timeout_ms, store.busy_timeout_ms);
        }
        if let Some(seed) = raw.seed {
            overlay(&mut self.tree_paths, seed.tree_paths);
            overlay(&mut self.nodes, seed.nodes);
            overlay(&mut self.delimiter, seed.delimiter);
        }
        overlay(&mut self.root_id, raw.root_id);
    }

    fn resolve(self, cwd: &Path, home: &Path) -> Result<EffectiveConfig, ConfigError> {
        let resolve_path = |raw: &str| {
            let expanded = expand_tilde(raw, home);
            if expanded.is_absolute() {
                expanded
            } else {
                cwd.join(expanded)
            }
        };

        let delimiter = match self.delimiter.as_deref() {
            None => DEFAULT_DELIMITER,
            Some(raw) => parse_delimiter(raw)?,
        };
        let seed = match (self.tree_paths, self.nodes) {
            (Some(tree_paths), Some(nodes)) => Some(SeedPaths {
                tree_paths: resolve_path(&tree_paths),
                nodes: resolve_path(&nodes),
                delimiter,
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteSeed),
        };

        Ok(EffectiveConfig {
            store_path: resolve_path(self.store_path.as_deref().unwrap_or(DEFAULT_STORE_PATH)),
            busy_timeout: Duration::from_millis(
                self.busy_timeout_ms.unwrap_or(DEFAULT_BUSY_TIMEOUT_MS),
            ),
            seed,
            root_id: self
                .root_id
                .filter(|raw| !raw.is_empty())
                .map(NodeId::from),
        })
    }
}

fn overlay<T>(slot: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *slot = incoming;
    }
}

/// Merges the user config, the nearest project config above `cwd`, and the
/// repo config, in that order.
pub fn load_effective_config(
    cwd: &Path,
    home: &Path,
    repo_config: Option<&Path>,
    user_config: Option<&Path>,
) -> Result<EffectiveConfig, ConfigError> {
    let mut layered = Layered::default();

    if let Some(path) = user_config.filter(|path| path.exists()) {
        layered.apply(load_raw(path)?);
    }
    if let Some(path) = find_nearest_project_config(cwd) {
        layered.apply(load_raw(&path)?);
    }
    if let Some(path) = repo_config.filter(|path| path.exists()) {
        layered.apply(load_raw(path)?);
    }

    layered.resolve(cwd, home)
}

pub fn find_nearest_project_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(PROJECT_CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}

fn load_raw(path: &Path) -> Result<RawConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(RawConfig::default());
    }
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

pub fn default_repo_config_yaml() -> String {
    r#"store:
  path: .treecache/tree.sqlite
  busy_timeout_ms: 5000
# Bulk-load tables used to populate an empty store and to rebuild a
# damaged one.
# seed:
#   tree_paths: data/tree_paths.csv
#   nodes: data/nodes.csv
#   delimiter: ";"
# root_id: "1"
"#
    .to_string()
}

pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(path)
}

pub fn parse_delimiter(raw: &str) -> Result<u8, ConfigError> {
    match raw.as_bytes() {
        [byte] if byte.is_ascii() => Ok(*byte),
        _ if raw == "\\t" => Ok(b'\t'),
        _ => Err(ConfigError::InvalidDelimiter(raw.to_string())),
    }
}
