//! Run directory prediction.
//!
//! The trainer writes each run to `<model_dir>/<name>`, appending a number
//! when that directory already exists (`exp`, `exp2`, `exp3`, ...). The
//! launcher applies the same rule ahead of time so it knows where each run's
//! checkpoints will land.

use std::path::{Path, PathBuf};

/// Return `path` if it is free (or `exist_ok`), otherwise `<path><n>` where
/// `n` is one past the largest number found right after the stem among
/// existing siblings (`exp3_old` counts as 3), or 2.
pub fn increment_path(path: &Path, exist_ok: bool) -> PathBuf {
    increment_with(path, exist_ok, &[])
}

fn increment_with(path: &Path, exist_ok: bool, claimed: &[PathBuf]) -> PathBuf {
    let taken = path.exists() || claimed.iter().any(|c| c == path);
    if !taken || exist_ok {
        return path.to_path_buf();
    }

    let Some(stem) = path.file_name().and_then(|n| n.to_str()) else {
        return path.to_path_buf();
    };
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut highest: Option<u64> = None;
    let mut consider = |name: &str| {
        if let Some(n) = numeric_suffix(name, stem) {
            highest = Some(highest.map_or(n, |h| h.max(n)));
        }
    };

    if let Ok(entries) = std::fs::read_dir(parent) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                consider(name);
            }
        }
    }
    for claimed_path in claimed {
        if claimed_path.parent().unwrap_or(Path::new("")) == path.parent().unwrap_or(Path::new(""))
        {
            if let Some(name) = claimed_path.file_name().and_then(|n| n.to_str()) {
                consider(name);
            }
        }
    }

    let next = highest.map_or(2, |h| h + 1);
    path.with_file_name(format!("{stem}{next}"))
}

/// The run of digits directly after `stem`; anything after it is ignored.
fn numeric_suffix(name: &str, stem: &str) -> Option<u64> {
    let rest = name.strip_prefix(stem)?;
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Predicts run directories for a whole plan.
///
/// Directories claimed by earlier runs in the plan count as existing, since
/// the trainer will have created them by the time later runs start.
#[derive(Debug, Default)]
pub struct RunDirPlanner {
    claimed: Vec<PathBuf>,
}

impl RunDirPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&mut self, model_dir: &Path, name: &str, exist_ok: bool) -> PathBuf {
        let dir = increment_with(&model_dir.join(name), exist_ok, &self.claimed);
        self.claimed.push(dir.clone());
        dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_free_path_is_returned() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exp");
        assert_eq!(increment_path(&path, false), path);
    }

    #[test]
    fn test_existing_path_gets_2() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exp");
        std::fs::create_dir(&path).unwrap();
        assert_eq!(increment_path(&path, false), dir.path().join("exp2"));
        assert_eq!(increment_path(&path, true), path);
    }

    #[test]
    fn test_highest_suffix_wins() {
        let dir = TempDir::new().unwrap();
        for name in ["exp", "exp2", "exp7", "exp_mask", "exp3a"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        assert_eq!(
            increment_path(&dir.path().join("exp"), false),
            dir.path().join("exp8")
        );

        std::fs::create_dir(dir.path().join("exp9_old")).unwrap();
        assert_eq!(
            increment_path(&dir.path().join("exp"), false),
            dir.path().join("exp10")
        );
    }

    #[test]
    fn test_trailing_text_after_number_still_counts() {
        let dir = TempDir::new().unwrap();
        for name in ["exp", "exp3_old"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        assert_eq!(
            increment_path(&dir.path().join("exp"), false),
            dir.path().join("exp4")
        );
    }

    #[test]
    fn test_planner_counts_claimed_dirs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("effb4_mask")).unwrap();

        let mut planner = RunDirPlanner::new();
        let first = planner.claim(dir.path(), "effb4_mask", false);
        let second = planner.claim(dir.path(), "effb4_mask", false);
        let other = planner.claim(dir.path(), "effb4_age", false);

        assert_eq!(first, dir.path().join("effb4_mask2"));
        assert_eq!(second, dir.path().join("effb4_mask3"));
        assert_eq!(other, dir.path().join("effb4_age"));
    }

    #[test]
    fn test_planner_exist_ok_reuses() {
        let dir = TempDir::new().unwrap();
        let mut planner = RunDirPlanner::new();
        let a = planner.claim(dir.path(), "exp", true);
        let b = planner.claim(dir.path(), "exp", true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_numeric_suffix() {
        assert_eq!(numeric_suffix("exp12", "exp"), Some(12));
        assert_eq!(numeric_suffix("exp", "exp"), None);
        assert_eq!(numeric_suffix("exp_2", "exp"), None);
        assert_eq!(numeric_suffix("exp3a", "exp"), Some(3));
        assert_eq!(numeric_suffix("exp3_old", "exp"), Some(3));
        assert_eq!(numeric_suffix("other3", "exp"), None);
    }
}
