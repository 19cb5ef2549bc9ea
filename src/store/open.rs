use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::seed::{SeedData, SeedPaths, read_seed};
use crate::store::{FatalError, StoreError, TreeStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Source for the initial population and for rebuilding after corruption.
    pub seed: Option<SeedPaths>,
    pub busy_timeout: Duration,
}

/// Non-terminal phases of opening a store. The terminal outcomes are the
/// `Ok` (healthy) and `Err` (fatal) results of [`open_with_report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPhase {
    Opening,
    Corrupt,
    Rebuilding,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenReport {
    /// Set when the first attempt failed and the store was rebuilt.
    pub recovered_from: Option<String>,
    /// True when the store was populated from the seed files during open.
    pub seeded: bool,
}

pub fn open(config: &StoreConfig) -> Result<TreeStore, FatalError> {
    open_with_report(config).map(|(store, _)| store)
}

/// Opens the store, checks it, and rebuilds it from the seed source once if
/// the existing file is damaged.
///
/// Nothing is discarded unless the file is damaged and the seed tables have
/// already been read successfully. Lock contention, a newer schema, an
/// unreadable seed or a missing seed source are fatal with the file intact.
pub fn open_with_report(config: &StoreConfig) -> Result<(TreeStore, OpenReport), FatalError> {
    let mut phase = OpenPhase::Opening;
    let mut report = OpenReport::default();
    let mut rebuild_seed: Option<SeedData> = None;
    loop {
        debug!(?phase, path = %config.path.display(), "opening store");
        phase = match phase {
            OpenPhase::Opening => match open_healthy(config) {
                Ok((store, seeded)) => {
                    report.seeded = seeded;
                    return Ok((store, report));
                }
                Err(err) if !err.is_damage() || config.seed.is_none() => {
                    return Err(fatal(config, err));
                }
                Err(err) => {
                    warn!(error = %err, path = %config.path.display(), "store damaged; rebuilding");
                    report.recovered_from = Some(err.to_string());
                    OpenPhase::Corrupt
                }
            },
            OpenPhase::Corrupt => {
                let Some(seed_paths) = &config.seed else {
                    return Err(fatal(
                        config,
                        StoreError::Corrupt("no seed source to rebuild from".to_string()),
                    ));
                };
                let seed = read_seed(seed_paths).map_err(|err| fatal(config, err.into()))?;
                discard_database(&config.path).map_err(|err| fatal(config, err.into()))?;
                rebuild_seed = Some(seed);
                OpenPhase::Rebuilding
            }
            OpenPhase::Rebuilding => {
                let store = match rebuild_seed.take() {
                    Some(seed) => rebuild(config, &seed),
                    None => Err(StoreError::Corrupt("rebuild lost its seed".to_string())),
                }
                .map_err(|err| fatal(config, err))?;
                info!(path = %config.path.display(), "store rebuilt");
                report.seeded = true;
                return Ok((store, report));
            }
        };
    }
}

fn open_healthy(config: &StoreConfig) -> Result<(TreeStore, bool), StoreError> {
    if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let store = TreeStore::open_path(&config.path)?;
    store.set_busy_timeout(config.busy_timeout)?;
    store.sanity_check()?;

    let mut seeded = false;
    if let Some(seed_paths) = &config.seed
        && store.is_empty()?
    {
        let seed = read_seed(seed_paths)?;
        store.seed(&seed)?;
        store.sanity_check()?;
        seeded = true;
    }
    Ok((store, seeded))
}

fn rebuild(config: &StoreConfig, seed: &SeedData) -> Result<TreeStore, StoreError> {
    let store = TreeStore::open_path(&config.path)?;
    store.set_busy_timeout(config.busy_timeout)?;
    store.seed(seed)?;
    store.sanity_check()?;
    Ok(store)
}

fn discard_database(path: &Path) -> io::Result<()> {
    let mut targets = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        targets.push(PathBuf::from(side));
    }
    for target in targets {
        match fs::remove_file(&target) {
            Ok(()) => debug!(path = %target.display(), "discarded"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn fatal(config: &StoreConfig, cause: StoreError) -> FatalError {
    FatalError {
        path: config.path.clone(),
        cause,
    }
}
