use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static ATOMIC_COUNTER: AtomicU64 = AtomicU64::new(0);
const TEMP_PREFIX: &str = ".treecache.tmp.";

pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    atomic_write_with(path, |file| file.write_all(bytes))
}

/// Streams content into a sibling temp file, fsyncs it, then renames it over
/// `path`. Readers see either the old file or the complete new one.
pub fn atomic_write_with<F>(path: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        Some(_) => Path::new("."),
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path `{}` has no parent directory", path.display()),
            ));
        }
    };
    fs::create_dir_all(parent)?;

    let tmp_path = temp_path_in_parent(parent, path)?;
    let mut tmp_file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&tmp_path)?;

    let write_result = (|| -> io::Result<()> {
        fill(&mut tmp_file)?;
        tmp_file.flush()?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        replace_file(&tmp_path, path)?;
        sync_dir(parent)
    })();

    if write_result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    write_result
}

fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Err(err) = fs::rename(from, to) {
        if !to.exists() {
            return Err(err);
        }
        fs::remove_file(to)?;
        fs::rename(from, to)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn temp_path_in_parent(parent: &Path, final_path: &Path) -> io::Result<PathBuf> {
    let file_name = final_path
        .file_name()
        .and_then(|value| value.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target filename"))?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(io::Error::other)?
        .subsec_nanos();
    let counter = ATOMIC_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(parent.join(format!(
        "{TEMP_PREFIX}{file_name}.{}.{nanos}.{counter}",
        std::process::id()
    )))
}
