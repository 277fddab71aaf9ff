//! Sequential sweep execution.
//!
//! A sweep runs exactly one trainer process at a time. Each child's output is
//! streamed line by line into the run's metrics; a per-run timeout and the
//! shared cancellation token both kill the child.

use super::checkpoint::scan_run_dir;
use super::experiment::{RunRecord, RunStatus, SweepReport};
use super::sweep::{PlannedRun, SweepPlan};
use crate::error::LaunchError;
use crate::runtime::TrainerRuntime;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long to keep reading pipes after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// One line of trainer output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub text: String,
    pub is_stderr: bool,
}

/// How a launched trainer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The process exited; `code` is `None` when it was killed by a signal.
    Exited { code: Option<i32> },
    TimedOut,
    Cancelled,
}

/// Starts a trainer run and waits for it to finish.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        run: &PlannedRun,
        on_line: &mut (dyn FnMut(OutputLine) + Send),
    ) -> Result<LaunchOutcome, LaunchError>;
}

/// Launches the trainer as a child process.
pub struct ProcessLauncher {
    runtime: TrainerRuntime,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl ProcessLauncher {
    pub fn new(runtime: TrainerRuntime, timeout: Option<Duration>, cancel: CancellationToken) -> Self {
        Self {
            runtime,
            timeout,
            cancel,
        }
    }
}

enum Stop {
    Exited(Option<i32>),
    Deadline,
    Cancelled,
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        run: &PlannedRun,
        on_line: &mut (dyn FnMut(OutputLine) + Send),
    ) -> Result<LaunchOutcome, LaunchError> {
        let mut cmd = self.runtime.command(&run.args, &run.env);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: self.runtime.python_cmd().display().to_string(),
            source,
        })?;
        debug!(pid = ?child.id(), name = %run.args.name, "Trainer started");

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, false, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, true, tx.clone()));
        }
        drop(tx);

        let timeout = self.timeout;
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let stop = loop {
            tokio::select! {
                Some(line) = rx.recv() => on_line(line),
                status = child.wait() => {
                    let status = status.map_err(LaunchError::Wait)?;
                    break Stop::Exited(status.code());
                }
                _ = &mut deadline => break Stop::Deadline,
                _ = self.cancel.cancelled() => break Stop::Cancelled,
            }
        };

        if !matches!(stop, Stop::Exited(_)) {
            if let Err(e) = child.kill().await {
                warn!(error = %e, name = %run.args.name, "Failed to kill trainer");
            }
        }

        let drain = async {
            while let Some(line) = rx.recv().await {
                on_line(line);
            }
        };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            debug!(name = %run.args.name, "Output pipes still open after exit; giving up");
        }

        Ok(match stop {
            Stop::Exited(code) => LaunchOutcome::Exited { code },
            Stop::Deadline => LaunchOutcome::TimedOut,
            Stop::Cancelled => LaunchOutcome::Cancelled,
        })
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    is_stderr: bool,
    tx: mpsc::UnboundedSender<OutputLine>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf).trim_end().to_string();
                if tx.send(OutputLine { text, is_stderr }).is_err() {
                    break;
                }
            }
        }
    }
}

/// Sweep-level execution policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Keep going after a failed or timed-out run.
    pub continue_on_failure: bool,
    /// Log trainer output at info level instead of debug.
    pub echo_output: bool,
}

/// Runs a plan one trainer at a time.
pub struct SweepRunner<L: Launcher> {
    launcher: L,
    options: RunOptions,
    cancel: CancellationToken,
}

impl<L: Launcher> SweepRunner<L> {
    pub fn new(launcher: L, options: RunOptions, cancel: CancellationToken) -> Self {
        Self {
            launcher,
            options,
            cancel,
        }
    }

    pub async fn run(&self, plan: &SweepPlan) -> SweepReport {
        self.run_with(plan, |_| {}).await
    }

    /// Run every planned run in order, calling `on_finished` after each one
    /// (including skipped runs).
    pub async fn run_with(
        &self,
        plan: &SweepPlan,
        mut on_finished: impl FnMut(&RunRecord),
    ) -> SweepReport {
        let mut report = SweepReport::new(&plan.name, &plan.source);
        let mut halted: Option<&'static str> = None;

        for run in &plan.runs {
            let mut record = RunRecord::new(run.args.clone(), run.run_dir.clone(), run.origin.clone());

            if halted.is_none() && self.cancel.is_cancelled() {
                halted = Some("sweep cancelled");
            }
            if let Some(reason) = halted {
                debug!(name = %record.name, reason, "Skipping run");
                record.finish(RunStatus::Skipped, None);
                on_finished(&record);
                report.runs.push(record);
                continue;
            }

            self.execute(run, &mut record).await;
            on_finished(&record);

            match record.status {
                RunStatus::Cancelled => halted = Some("sweep cancelled"),
                status if status.is_failure() && !self.options.continue_on_failure => {
                    halted = Some("earlier run failed");
                }
                _ => {}
            }
            report.runs.push(record);
        }

        report.finished_at = Some(chrono::Utc::now());
        info!(
            sweep = %report.name,
            completed = report.count(RunStatus::Completed),
            failed = report.count(RunStatus::Failed) + report.count(RunStatus::TimedOut),
            skipped = report.count(RunStatus::Skipped),
            "Sweep finished"
        );
        report
    }

    async fn execute(&self, run: &PlannedRun, record: &mut RunRecord) {
        info!(
            index = run.index + 1,
            name = %run.args.name,
            label = %run.args.label,
            run_dir = %run.run_dir.display(),
            "Starting run"
        );
        record.start();

        let echo = self.options.echo_output;
        let name = run.args.name.as_str();
        let metrics = &mut record.metrics;
        let mut on_line = |line: OutputLine| {
            metrics.observe_line(&line.text);
            if echo {
                info!(target: "trainer", run = name, stderr = line.is_stderr, "{}", line.text);
            } else {
                debug!(target: "trainer", run = name, stderr = line.is_stderr, "{}", line.text);
            }
        };
        let outcome = self.launcher.launch(run, &mut on_line).await;

        match outcome {
            Ok(LaunchOutcome::Exited { code: Some(0) }) => {
                record.finish(RunStatus::Completed, Some(0));
            }
            Ok(LaunchOutcome::Exited { code }) => {
                warn!(name = %record.name, exit_code = ?code, "Run failed");
                record.finish(RunStatus::Failed, code);
            }
            Ok(LaunchOutcome::TimedOut) => {
                warn!(name = %record.name, "Run timed out");
                record.finish(RunStatus::TimedOut, None);
            }
            Ok(LaunchOutcome::Cancelled) => {
                warn!(name = %record.name, "Run cancelled");
                record.finish(RunStatus::Cancelled, None);
            }
            Err(e) => {
                error!(name = %record.name, error = %e, "Could not launch trainer");
                record.error = Some(e.to_string());
                record.finish(RunStatus::Failed, None);
            }
        }

        match scan_run_dir(&record.run_dir) {
            Ok(artifacts) => record.artifacts = artifacts,
            Err(e) => warn!(run_dir = %record.run_dir.display(), error = %e, "Artifact scan failed"),
        }

        info!(
            name = %record.name,
            status = %record.status,
            best_val_f1 = ?record.metrics.objective(),
            duration_secs = ?record.duration_secs(),
            "Run finished"
        );
    }
}
