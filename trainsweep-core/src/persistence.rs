//! On-disk JSON state: the sweep ledger and search results.
//!
//! Writes go to a uniquely named temp file in the target directory and are
//! renamed into place, so readers only ever see a complete document. Ledger
//! updates from concurrent `trainsweep` processes are serialized through a
//! lock file next to the ledger.

use crate::error::SweepError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// How long to wait for another process to release the ledger.
const LOCK_WAIT: Duration = Duration::from_secs(10);
/// A lock file older than this is left over from a crashed process.
const STALE_LOCK: Duration = Duration::from_secs(120);
const LOCK_POLL: Duration = Duration::from_millis(25);

/// Serialize `data` as pretty JSON and atomically replace `path` with it.
/// Creates parent directories if needed.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<(), SweepError> {
    let json = serde_json::to_string_pretty(data)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically replace `path` with `data`.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), SweepError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path);
    let written = std::fs::write(&tmp, data).and_then(|()| std::fs::rename(&tmp, path));
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// `.<file>.<uuid>.tmp` in the same directory, so the rename stays on one
/// filesystem and two writers never share a temp file.
fn temp_sibling(path: &Path) -> PathBuf {
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Load and deserialize JSON from `path`; `Ok(None)` when it does not exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SweepError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&data)?))
}

/// Read-modify-write the document at `path` while holding its lock.
///
/// A missing document starts from `T::default()`.
pub fn update_json<T, F>(path: &Path, update: F) -> Result<(), SweepError>
where
    T: Serialize + DeserializeOwned + Default,
    F: FnOnce(&mut T),
{
    let _lock = FileLock::acquire(path, LOCK_WAIT)?;
    let mut doc: T = load_json(path)?.unwrap_or_default();
    update(&mut doc);
    atomic_write_json(path, &doc)
}

/// Exclusive advisory lock on a document, held as `<path>.lock`.
///
/// Released when dropped.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(target: &Path, wait: Duration) -> Result<Self, SweepError> {
        let path = lock_path(target);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let deadline = Instant::now() + wait;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Owner pid helps when someone has to clean up by hand.
                    let _ = write!(file, "{}", std::process::id());
                    debug!(lock = %path.display(), "Acquired ledger lock");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        warn!(lock = %path.display(), "Removing stale ledger lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(SweepError::Locked { path });
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release ledger lock");
        }
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn is_stale(lock: &Path) -> bool {
    std::fs::metadata(lock)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Ledger {
        names: Vec<String>,
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_then_load_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".trainsweep").join("history.json");
        let ledger = Ledger {
            names: vec!["effb4_mask".into()],
        };

        atomic_write_json(&path, &ledger).unwrap();
        assert_eq!(load_json::<Ledger>(&path).unwrap(), Some(ledger));
        assert_eq!(files_in(path.parent().unwrap()), vec!["history.json"]);
    }

    #[test]
    fn test_temp_names_are_unique() {
        let path = Path::new("/work/.trainsweep/history.json");
        let (a, b) = (temp_sibling(path), temp_sibling(path));
        assert_ne!(a, b);
        assert_eq!(a.parent(), path.parent());
        assert!(a.file_name().unwrap().to_string_lossy().starts_with(".history.json."));
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("none.json");
        assert!(load_json::<Ledger>(&missing).unwrap().is_none());

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{not json").unwrap();
        assert!(matches!(
            load_json::<Ledger>(&broken),
            Err(SweepError::Serialization(_))
        ));
    }

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("history.json");

        let held = FileLock::acquire(&target, Duration::ZERO).unwrap();
        assert!(dir.path().join("history.json.lock").exists());
        assert!(matches!(
            FileLock::acquire(&target, Duration::from_millis(50)),
            Err(SweepError::Locked { .. })
        ));

        drop(held);
        assert!(!dir.path().join("history.json.lock").exists());
        assert!(FileLock::acquire(&target, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("history.json");
        let lock = dir.path().join("history.json.lock");
        std::fs::write(&lock, "12345").unwrap();
        let old = SystemTime::now() - STALE_LOCK - Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&lock)
            .unwrap()
            .set_modified(old)
            .unwrap();

        assert!(FileLock::acquire(&target, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");

        std::thread::scope(|scope| {
            for i in 0..8 {
                let path = &path;
                scope.spawn(move || {
                    update_json::<Ledger, _>(path, |ledger| ledger.names.push(format!("run{i}")))
                        .unwrap();
                });
            }
        });

        let mut names = load_json::<Ledger>(&path).unwrap().unwrap().names;
        names.sort();
        let expected: Vec<String> = (0..8).map(|i| format!("run{i}")).collect();
        assert_eq!(names, expected);
        assert_eq!(files_in(dir.path()), vec!["history.json"]);
    }
}
