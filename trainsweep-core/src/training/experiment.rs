//! Sweep ledger: per-run records and the on-disk history of sweeps.

use super::checkpoint::Artifact;
use super::metrics::RunMetrics;
use super::reproducibility::EnvironmentSnapshot;
use crate::error::SweepError;
use crate::invocation::{Label, Origin, TrainArgs};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    /// Not started because an earlier run failed or the sweep was cancelled.
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Whether this outcome stops the rest of a sweep (absent `continue_on_failure`).
    pub fn is_failure(&self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::TimedOut)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown run status '{s}'"))
    }
}

/// One trainer run within a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub name: String,
    pub label: Label,
    pub args: TrainArgs,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub run_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    #[serde(default)]
    pub metrics: RunMetrics,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    /// Why the launcher could not run the trainer, if it could not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(args: TrainArgs, run_dir: PathBuf, origin: Option<Origin>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: args.name.clone(),
            label: args.label,
            args,
            status: RunStatus::Pending,
            exit_code: None,
            run_dir,
            origin,
            metrics: RunMetrics::default(),
            artifacts: Vec::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: RunStatus, exit_code: Option<i32>) {
        self.status = status;
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_secs(&self) -> Option<f64> {
        let (start, end) = (self.started_at?, self.finished_at?);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// A whole sweep: its runs in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub id: String,
    pub name: String,
    /// Script, manifest or `cli` that produced the sweep.
    pub source: String,
    pub environment: Option<EnvironmentSnapshot>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub runs: Vec<RunRecord>,
}

impl SweepReport {
    pub fn new(name: &str, source: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            source: source.to_string(),
            environment: None,
            started_at: Utc::now(),
            finished_at: None,
            runs: Vec::new(),
        }
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }

    /// True when every run completed.
    pub fn succeeded(&self) -> bool {
        self.runs.iter().all(|r| r.status == RunStatus::Completed)
    }

    /// Completed run with the highest validation F1.
    pub fn best_run(&self) -> Option<&RunRecord> {
        self.runs
            .iter()
            .filter(|r| r.status == RunStatus::Completed)
            .filter_map(|r| r.metrics.objective().map(|f1| (r, f1)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(r, _)| r)
    }
}

/// History of sweeps in a workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepHistory {
    pub sweeps: Vec<SweepReport>,
}

impl SweepHistory {
    pub fn new() -> Self {
        Self { sweeps: Vec::new() }
    }

    /// Default ledger location inside a workspace.
    pub fn default_path(workspace: &Path) -> PathBuf {
        workspace
            .join(crate::config::WORKSPACE_DIR)
            .join("history.json")
    }

    pub fn add(&mut self, report: SweepReport) {
        self.sweeps.push(report);
    }

    pub fn find(&self, id: &str) -> Option<&SweepReport> {
        self.sweeps.iter().find(|s| s.id == id || s.id.starts_with(id))
    }

    /// Runs across all sweeps with the given status, newest sweep first.
    pub fn runs_by_status(&self, status: RunStatus) -> Vec<(&SweepReport, &RunRecord)> {
        self.sweeps
            .iter()
            .rev()
            .flat_map(|s| s.runs.iter().map(move |r| (s, r)))
            .filter(|(_, r)| r.status == status)
            .collect()
    }

    pub fn load(path: &Path) -> Result<Self, SweepError> {
        Ok(crate::persistence::load_json(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<(), SweepError> {
        crate::persistence::atomic_write_json(path, self)
    }

    /// Append `report` to the ledger at `path`. Holds the ledger lock across
    /// the read and the write, so sweeps finishing in parallel processes are
    /// all kept.
    pub fn append(path: &Path, report: SweepReport) -> Result<(), SweepError> {
        crate::persistence::update_json(path, |history: &mut SweepHistory| history.add(report))
    }
}
