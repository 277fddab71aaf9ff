//! Training sweeps: planning, execution, metrics, checkpoints, ledger.

pub mod checkpoint;
pub mod experiment;
pub mod metrics;
pub mod reproducibility;
pub mod run_dir;
pub mod runner;
pub mod schedule;
pub mod sweep;

pub use checkpoint::{Artifact, ArtifactKind, scan_run_dir};
pub use experiment::{RunRecord, RunStatus, SweepHistory, SweepReport};
pub use metrics::RunMetrics;
pub use reproducibility::EnvironmentSnapshot;
pub use run_dir::{RunDirPlanner, increment_path};
pub use runner::{LaunchOutcome, Launcher, OutputLine, ProcessLauncher, RunOptions, SweepRunner};
pub use schedule::StepLr;
pub use sweep::{HyperparamSweep, PlannedRun, SweepPlan, SweepStrategy};
