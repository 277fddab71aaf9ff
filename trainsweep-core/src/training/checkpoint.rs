//! Checkpoint discovery for finished runs.
//!
//! The trainer leaves `best.pth`, `last.pth` and `config.json` in its run
//! directory. After each run the launcher records which of them exist, with
//! size and content hash, so the ledger can tell runs apart later.

use crate::error::SweepError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Kind of file the trainer writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Weights with the best validation F1.
    BestWeights,
    /// Weights after the final epoch.
    LastWeights,
    /// The trainer's own dump of its arguments.
    Config,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::BestWeights,
        ArtifactKind::LastWeights,
        ArtifactKind::Config,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::BestWeights => "best.pth",
            ArtifactKind::LastWeights => "last.pth",
            ArtifactKind::Config => "config.json",
        }
    }
}

/// A file found in a run directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Record the trainer artifacts present in `run_dir`.
///
/// A missing directory yields an empty list; the run may have died before
/// creating it.
pub fn scan_run_dir(run_dir: &Path) -> Result<Vec<Artifact>, SweepError> {
    let mut artifacts = Vec::new();
    if !run_dir.is_dir() {
        return Ok(artifacts);
    }

    for kind in ArtifactKind::ALL {
        let path = run_dir.join(kind.file_name());
        if !path.is_file() {
            continue;
        }
        let size_bytes = std::fs::metadata(&path)?.len();
        artifacts.push(Artifact {
            kind,
            sha256: hash_file(&path)?,
            path,
            size_bytes,
        });
    }
    Ok(artifacts)
}

fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Read the trainer's `config.json` from a run directory as raw JSON.
pub fn read_run_config(run_dir: &Path) -> Result<Option<serde_json::Value>, SweepError> {
    Ok(crate::persistence::load_json(
        &run_dir.join(ArtifactKind::Config.file_name()),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_missing_dir() {
        let dir = TempDir::new().unwrap();
        let artifacts = scan_run_dir(&dir.path().join("never_created")).unwrap();
        assert!(artifacts.is_empty());
    }

    #[test]
    fn test_scan_finds_weights_and_config() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("best.pth"), b"weights").unwrap();
        std::fs::write(dir.path().join("config.json"), br#"{"epochs": 3}"#).unwrap();
        std::fs::write(dir.path().join("events.out.tfevents"), b"x").unwrap();

        let artifacts = scan_run_dir(dir.path()).unwrap();
        let kinds: Vec<ArtifactKind> = artifacts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ArtifactKind::BestWeights, ArtifactKind::Config]);

        let best = &artifacts[0];
        assert_eq!(best.size_bytes, 7);
        assert_eq!(best.sha256.len(), 64);
        assert_ne!(best.sha256, artifacts[1].sha256);
    }

    #[test]
    fn test_hash_is_content_based() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.pth");
        let b = dir.path().join("b.pth");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();
        assert_eq!(hash_file(&a).unwrap(), hash_file(&b).unwrap());

        std::fs::write(&b, b"other bytes").unwrap();
        assert_ne!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
    }

    #[test]
    fn test_read_run_config() {
        let dir = TempDir::new().unwrap();
        assert!(read_run_config(dir.path()).unwrap().is_none());

        std::fs::write(dir.path().join("config.json"), br#"{"epochs": 3, "optuna": false}"#).unwrap();
        let config = read_run_config(dir.path()).unwrap().unwrap();
        assert_eq!(config["epochs"], 3);
    }
}
