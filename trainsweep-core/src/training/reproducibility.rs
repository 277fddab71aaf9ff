//! Reproducibility tracking: environment snapshots taken at sweep start.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Variables that change what the trainer sees.
const TRACKED_VARS: &[&str] = &[
    "PATH",
    "PYTHONPATH",
    "CUDA_VISIBLE_DEVICES",
    "SM_CHANNEL_TRAIN",
    "SM_MODEL_DIR",
];

/// Snapshot of the launch environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub interpreter_version: Option<String>,
    pub system_info: String,
    pub platform: String,
    pub hostname: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// SHA-256 over the tracked environment variables.
    pub env_vars_hash: String,
}

impl EnvironmentSnapshot {
    pub fn capture() -> Self {
        Self {
            interpreter_version: None,
            system_info: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            platform: std::env::consts::OS.to_string(),
            hostname: std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()),
            timestamp: Utc::now(),
            env_vars_hash: compute_env_vars_hash(|var| std::env::var(var).ok()),
        }
    }

    pub fn with_interpreter(mut self, version: Option<String>) -> Self {
        self.interpreter_version = version;
        self
    }
}

fn compute_env_vars_hash(lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut hasher = Sha256::new();
    for var in TRACKED_VARS {
        let value = lookup(var).unwrap_or_default();
        hasher.update(var.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture() {
        let snap = EnvironmentSnapshot::capture().with_interpreter(Some("Python 3.10.13".into()));
        assert_eq!(snap.platform, std::env::consts::OS);
        assert_eq!(snap.env_vars_hash.len(), 64);
        assert_eq!(snap.interpreter_version.as_deref(), Some("Python 3.10.13"));
    }

    #[test]
    fn test_hash_depends_on_tracked_vars() {
        let base = compute_env_vars_hash(|_| None);
        let with_gpu = compute_env_vars_hash(|var| {
            (var == "CUDA_VISIBLE_DEVICES").then(|| "0".to_string())
        });
        let untracked = compute_env_vars_hash(|var| (var == "HOME").then(|| "/root".to_string()));
        assert_ne!(base, with_gpu);
        assert_eq!(base, untracked);
    }
}
