//! End-to-end sweeps against a stand-in trainer written in POSIX shell.

#![cfg(unix)]

use pretty_assertions::assert_eq;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use trainsweep_core::invocation::{Invocation, read_script};
use trainsweep_core::training::{
    ArtifactKind, ProcessLauncher, RunOptions, RunStatus, SweepHistory, SweepPlan, SweepReport,
    SweepRunner,
};
use trainsweep_core::{Manifest, SweepConfig, TrainArgs, TrainerRuntime};

const FAKE_TRAINER: &str = r#"#!/bin/sh
name=exp
while [ $# -gt 0 ]; do
  case "$1" in
    --name) name="$2"; shift 2 ;;
    *) shift ;;
  esac
done
case "$name" in *slow*) exec sleep 30 ;; esac
mkdir -p "$SM_MODEL_DIR/$name"
echo "Epoch[1/2](10/10) || training loss 0.6 || training accuracy 70.00% || training f1 60.00% || lr 0.001"
echo "[Val] f1 : 55.00%, loss: 0.70 || best f1 : 55.00%, best loss: 0.70"
echo "Epoch[2/2](10/10) || training loss 0.4 || training accuracy 80.00% || training f1 72.00% || lr 0.0005"
echo "[Val] f1 : 66.00%, loss: 0.50 || best f1 : 66.00%, best loss: 0.50"
printf weights > "$SM_MODEL_DIR/$name/best.pth"
echo "UserWarning: something noisy" >&2
case "$name" in *fail*) exit 3 ;; esac
exit 0
"#;

struct Workspace {
    dir: TempDir,
    runtime: TrainerRuntime,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake_train.sh");
        std::fs::write(&script, FAKE_TRAINER).unwrap();

        let mut config = SweepConfig::default();
        config.trainer.python_path = PathBuf::from("sh");
        config.trainer.script = script;
        config.paths.data_dir = dir.path().join("data");
        config.paths.model_dir = dir.path().join("model");
        let runtime = TrainerRuntime::new(&config, dir.path());
        Self { dir, runtime }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn plan(&self, names: &[&str]) -> SweepPlan {
        let invocations = names
            .iter()
            .map(|name| {
                Invocation::new(TrainArgs {
                    name: name.to_string(),
                    epochs: 2,
                    ..Default::default()
                })
            })
            .collect();
        SweepPlan::build("it", "cli", invocations, &self.runtime).unwrap()
    }

    async fn run(&self, plan: &SweepPlan, options: RunOptions, timeout: Option<Duration>) -> SweepReport {
        let cancel = CancellationToken::new();
        let launcher = ProcessLauncher::new(self.runtime.clone(), timeout, cancel.clone());
        SweepRunner::new(launcher, options, cancel).run(plan).await
    }
}

fn statuses(report: &SweepReport) -> Vec<RunStatus> {
    report.runs.iter().map(|r| r.status).collect()
}

#[tokio::test]
async fn test_manifest_sweep_records_metrics_and_artifacts() {
    let ws = Workspace::new();
    let manifest = Manifest::parse(
        "[sweep]\nname = \"effb4\"\nlabels = [\"mask\", \"gender\"]\n[base]\nepochs = 2\n",
    )
    .unwrap();
    let plan = SweepPlan::build("effb4", "sweep.toml", manifest.expand().unwrap(), &ws.runtime).unwrap();
    let report = ws.run(&plan, RunOptions::default(), None).await;

    assert!(report.succeeded(), "{:?}", statuses(&report));
    let mask = &report.runs[0];
    assert_eq!(mask.name, "effb4_mask");
    assert_eq!(mask.exit_code, Some(0));
    assert_eq!(mask.metrics.epochs_completed, 2);
    assert_eq!(mask.metrics.best_epoch, Some(2));
    assert!((mask.metrics.best_val_f1.unwrap() - 0.66).abs() < 1e-9);
    assert_eq!(mask.metrics.last_lr, Some(0.0005));
    assert_eq!(mask.run_dir, ws.path().join("model").join("effb4_mask"));

    let kinds: Vec<ArtifactKind> = mask.artifacts.iter().map(|a| a.kind).collect();
    assert_eq!(kinds, vec![ArtifactKind::BestWeights]);

    let history_path = SweepHistory::default_path(ws.path());
    SweepHistory::append(&history_path, report.clone()).unwrap();
    let history = SweepHistory::load(&history_path).unwrap();
    assert_eq!(history.sweeps[0].runs.len(), 2);
}

#[tokio::test]
async fn test_failure_stops_the_sweep() {
    let ws = Workspace::new();
    let plan = ws.plan(&["first", "second_fail", "third"]);
    let report = ws.run(&plan, RunOptions::default(), None).await;

    assert_eq!(
        statuses(&report),
        vec![RunStatus::Completed, RunStatus::Failed, RunStatus::Skipped]
    );
    assert_eq!(report.runs[1].exit_code, Some(3));
    // The failed run still wrote weights before exiting.
    assert_eq!(report.runs[1].artifacts.len(), 1);
    assert!(!ws.path().join("model").join("third").exists());
}

#[tokio::test]
async fn test_continue_on_failure_runs_everything() {
    let ws = Workspace::new();
    let plan = ws.plan(&["a_fail", "b"]);
    let options = RunOptions {
        continue_on_failure: true,
        ..Default::default()
    };
    let report = ws.run(&plan, options, None).await;
    assert_eq!(statuses(&report), vec![RunStatus::Failed, RunStatus::Completed]);
}

#[tokio::test]
async fn test_timeout_kills_trainer() {
    let ws = Workspace::new();
    let plan = ws.plan(&["slow", "after"]);
    let started = Instant::now();
    let report = ws
        .run(&plan, RunOptions::default(), Some(Duration::from_millis(500)))
        .await;

    assert_eq!(statuses(&report), vec![RunStatus::TimedOut, RunStatus::Skipped]);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_cancellation_marks_current_and_skips_rest() {
    let ws = Workspace::new();
    let plan = ws.plan(&["slow", "after"]);
    let cancel = CancellationToken::new();
    let launcher = ProcessLauncher::new(ws.runtime.clone(), None, cancel.clone());
    let runner = SweepRunner::new(launcher, RunOptions::default(), cancel.clone());

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });
    let report = runner.run(&plan).await;
    trigger.await.unwrap();

    assert_eq!(statuses(&report), vec![RunStatus::Cancelled, RunStatus::Skipped]);
}

#[tokio::test]
async fn test_search_records_best_trial() {
    let ws = Workspace::new();
    let manifest = Manifest::parse(
        "[sweep]\nname = \"tune\"\n[search]\nn_trials = 3\nseed = 11\n",
    )
    .unwrap();
    let mut search = manifest.search_plan().unwrap();
    let plan = SweepPlan::build("tune", "tune.toml", search.invocations.clone(), &ws.runtime).unwrap();

    let cancel = CancellationToken::new();
    let launcher = ProcessLauncher::new(ws.runtime.clone(), None, cancel.clone());
    let runner = SweepRunner::new(launcher, RunOptions::default(), cancel);
    let mut trial = 0;
    let report = runner
        .run_with(&plan, |record| {
            search
                .sweep
                .record(trial, record.metrics.objective(), &record.status.to_string());
            trial += 1;
        })
        .await;

    assert!(report.succeeded());
    let best = search.sweep.best().unwrap();
    assert_eq!(best.trial_number, 0);
    assert_eq!(best.run_name.as_deref(), Some("tune_0"));

    let written = search
        .sweep
        .write_best(&ws.path().join("model"))
        .unwrap()
        .unwrap();
    assert_eq!(written.file_name().unwrap(), "search_tune_0.6600.json");
}

#[tokio::test]
async fn test_driver_script_to_plan() {
    let ws = Workspace::new();
    let script = ws.path().join("run.sh");
    std::fs::write(
        &script,
        "#!/bin/bash\n\
         EPOCHS=30\n\
         echo starting\n\
         python train.py --epochs $EPOCHS --label mask --resize 380 380 --name effb4 \\\n\
           --lr 1e-4 --optimizer AdamW\n\
         python train.py --epochs $EPOCHS --label gender --resize 380 380 --name effb4 --lr 1e-4\n",
    )
    .unwrap();

    let parsed = read_script(&script, "fake_train.sh").unwrap();
    assert!(parsed.invocations.is_empty());

    let parsed = read_script(&script, "train.py").unwrap();
    assert_eq!(parsed.invocations.len(), 2);
    assert_eq!(parsed.invocations[0].origin.as_ref().unwrap().line, 4);
    assert_eq!(parsed.invocations[0].args.epochs, 30);

    let plan = SweepPlan::build("run", "run.sh", parsed.invocations, &ws.runtime).unwrap();
    let model = ws.path().join("model");
    assert_eq!(plan.runs[0].run_dir, model.join("effb4"));
    assert_eq!(plan.runs[1].run_dir, model.join("effb42"));
    assert_eq!(plan.duplicate_names(), vec!["effb4".to_string()]);
}
