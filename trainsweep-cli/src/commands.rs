//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, ExecArgs};
use anyhow::{Context, bail};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trainsweep_core::config::{SweepConfig, workspace_config_path};
use trainsweep_core::invocation::script::quote;
use trainsweep_core::invocation::{Invocation, Label, parse_argv, read_script};
use trainsweep_core::manifest::{Manifest, SearchPlan, SweepSection};
use trainsweep_core::training::{
    EnvironmentSnapshot, ProcessLauncher, RunOptions, RunRecord, RunStatus, StepLr,
    SweepHistory, SweepPlan, SweepReport, SweepRunner,
};
use trainsweep_core::TrainerRuntime;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    config: SweepConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match command {
        Commands::Check { files } => handle_check(&files, &config),
        Commands::Plan { file, only } => handle_plan(&file, &only, &config, workspace),
        Commands::Run {
            file,
            dry_run,
            only,
            exec,
        } => handle_run(&file, dry_run, &only, &exec, &config, workspace).await,
        Commands::Train {
            labels,
            dry_run,
            exec,
            flags,
        } => handle_train(&flags, &labels, dry_run, &exec, &config, workspace).await,
        Commands::Search {
            manifest,
            dry_run,
            exec,
        } => {
            let loaded = Manifest::load(&manifest)
                .with_context(|| format!("Failed to load manifest {}", manifest.display()))?;
            run_search(loaded, &manifest, dry_run, &exec, &config, workspace).await
        }
        Commands::History { id, status, limit } => handle_history(id, status, limit, workspace),
        Commands::Config { action } => handle_config(action, &config, workspace),
    }
}

/// Invocations read from a driver script or manifest.
struct Source {
    name: String,
    origin: String,
    invocations: Vec<Invocation>,
    manifest: Option<Manifest>,
}

fn is_manifest(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}

fn load_source(path: &Path, config: &SweepConfig) -> anyhow::Result<Source> {
    let origin = path.display().to_string();

    if is_manifest(path) {
        let manifest = Manifest::load(path)
            .with_context(|| format!("Failed to load manifest {origin}"))?;
        let invocations = manifest.expand()?;
        return Ok(Source {
            name: manifest.sweep.name.clone(),
            origin,
            invocations,
            manifest: Some(manifest),
        });
    }

    let script = read_script(path, &config.trainer.script_name())
        .with_context(|| format!("Failed to read script {origin}"))?;
    for skipped in &script.skipped {
        debug!(line = skipped.line, command = %skipped.command, "Ignoring non-trainer command");
    }
    for invocation in &script.invocations {
        let missing = invocation.missing_required();
        if !missing.is_empty() {
            warn!(
                origin = ?invocation.origin.as_ref().map(|o| o.to_string()),
                missing = ?missing,
                "Invocation relies on trainer defaults"
            );
        }
    }
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sweep".to_string());

    Ok(Source {
        name,
        origin,
        invocations: script.invocations,
        manifest: None,
    })
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

fn handle_check(files: &[std::path::PathBuf], config: &SweepConfig) -> anyhow::Result<()> {
    let mut failed = 0;
    for file in files {
        let (runs, problems) = check_file(file, config);
        if problems.is_empty() {
            println!("ok    {} ({runs} runs)", file.display());
        } else {
            failed += 1;
            println!("FAIL  {}", file.display());
            for problem in problems {
                println!("      {problem}");
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} files failed the check", files.len());
    }
    Ok(())
}

/// Number of runs found and every problem with them.
fn check_file(file: &Path, config: &SweepConfig) -> (usize, Vec<String>) {
    if is_manifest(file) {
        return match Manifest::load(file).and_then(|m| m.expand()) {
            Ok(invocations) => (invocations.len(), Vec::new()),
            Err(e) => (0, vec![e.to_string()]),
        };
    }

    let script_name = config.trainer.script_name();
    let script = match read_script(file, &script_name) {
        Ok(script) => script,
        Err(e) => return (0, vec![e.to_string()]),
    };

    let mut problems = Vec::new();
    if script.invocations.is_empty() {
        problems.push(format!("no {script_name} invocations found"));
    }
    for invocation in &script.invocations {
        let at = invocation
            .origin
            .as_ref()
            .map(|o| format!("line {}", o.line))
            .unwrap_or_default();
        problems.extend(invocation.check().into_iter().map(|p| format!("{at}: {p}")));
    }
    (script.invocations.len(), problems)
}

// ---------------------------------------------------------------------------
// plan / run / train
// ---------------------------------------------------------------------------

/// One invocation per label, named `<name>_<label>`.
fn label_fan_out(invocation: Invocation, labels: &[Label]) -> anyhow::Result<Vec<Invocation>> {
    if labels.is_empty() {
        return Ok(vec![invocation]);
    }
    if let Some(label) = labels
        .iter()
        .enumerate()
        .find_map(|(i, label)| labels[..i].contains(label).then_some(label))
    {
        bail!("--labels lists '{label}' more than once");
    }

    let name = &invocation.args.name;
    Ok(labels
        .iter()
        .map(|label| {
            let mut inv = invocation.clone();
            inv.args.label = *label;
            inv.args.name = format!("{name}_{label}");
            inv
        })
        .collect())
}

fn handle_plan(
    file: &Path,
    only: &[Label],
    config: &SweepConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    let source = load_source(file, config)?;
    let runtime = TrainerRuntime::new(config, workspace);
    let plan =
        SweepPlan::build_only(&source.name, &source.origin, source.invocations, only, &runtime)?;
    print_plan(&plan, &runtime);
    Ok(())
}

async fn handle_run(
    file: &Path,
    dry_run: bool,
    only: &[Label],
    exec: &ExecArgs,
    config: &SweepConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    let source = load_source(file, config)?;
    if let Some(manifest) = source.manifest.clone().filter(|m| m.is_search()) {
        if !only.is_empty() {
            warn!("--only is ignored for searches");
        }
        return run_search(manifest, file, dry_run, exec, config, workspace).await;
    }

    let runtime = TrainerRuntime::new(config, workspace);
    let plan =
        SweepPlan::build_only(&source.name, &source.origin, source.invocations, only, &runtime)?;
    if plan.runs.is_empty() {
        bail!("Nothing to run in {}", file.display());
    }

    if dry_run {
        print_plan(&plan, &runtime);
        return Ok(());
    }

    let sweep_section = source.manifest.as_ref().map(|m| &m.sweep);
    let (options, timeout) = execution_settings(config, exec, sweep_section);
    let report = execute(&plan, options, timeout, runtime, workspace, |_| {}).await?;
    ensure_succeeded(&report)
}

async fn handle_train(
    flags: &[String],
    labels: &[Label],
    dry_run: bool,
    exec: &ExecArgs,
    config: &SweepConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    let invocation = parse_argv(flags).context("Invalid trainer flags")?;
    let name = invocation.args.name.clone();
    let invocations = label_fan_out(invocation, labels)?;

    let runtime = TrainerRuntime::new(config, workspace);
    let plan = SweepPlan::build(&name, "cli", invocations, &runtime)?;
    if dry_run {
        print_plan(&plan, &runtime);
        return Ok(());
    }

    let (options, timeout) = execution_settings(config, exec, None);
    let report = execute(&plan, options, timeout, runtime, workspace, |_| {}).await?;
    ensure_succeeded(&report)
}

// ---------------------------------------------------------------------------
// search
// ---------------------------------------------------------------------------

async fn run_search(
    manifest: Manifest,
    path: &Path,
    dry_run: bool,
    exec: &ExecArgs,
    config: &SweepConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    let SearchPlan {
        mut sweep,
        invocations,
    } = manifest.search_plan()?;

    let runtime = TrainerRuntime::new(config, workspace);
    let plan = SweepPlan::build(
        &sweep.name,
        &path.display().to_string(),
        invocations,
        &runtime,
    )?;
    if dry_run {
        print_plan(&plan, &runtime);
        return Ok(());
    }

    let results_dir = plan.runs.first().map(|r| runtime.model_dir_for(&r.args, &r.env));
    let (options, timeout) = execution_settings(config, exec, Some(&manifest.sweep));

    let mut trial = 0;
    let report = execute(&plan, options, timeout, runtime, workspace, |record| {
        sweep.record(trial, record.metrics.objective(), &record.status.to_string());
        trial += 1;
    })
    .await?;

    match sweep.best() {
        Some(best) => {
            println!(
                "\nBest trial #{} ({}): val f1 {:.4}",
                best.trial_number,
                best.run_name.as_deref().unwrap_or("-"),
                best.metric.unwrap_or_default()
            );
            for (key, value) in &best.params {
                println!("    {key} = {value}");
            }
        }
        None => println!("\nNo trial reported a validation F1."),
    }

    if let Some(dir) = results_dir
        && let Some(written) = sweep
            .write_best(&dir)
            .context("Failed to write search results")?
    {
        println!("Best parameters written to {}", written.display());
    }

    ensure_succeeded(&report)
}

// ---------------------------------------------------------------------------
// execution helpers
// ---------------------------------------------------------------------------

/// Command-line flags win over the manifest, which wins over configuration.
fn execution_settings(
    config: &SweepConfig,
    exec: &ExecArgs,
    sweep: Option<&SweepSection>,
) -> (RunOptions, Option<Duration>) {
    let continue_on_failure = exec.continue_on_failure
        || sweep
            .and_then(|s| s.continue_on_failure)
            .unwrap_or(config.execution.continue_on_failure);
    let timeout = exec
        .timeout
        .or_else(|| sweep.and_then(|s| s.timeout_secs))
        .or(config.trainer.timeout_secs)
        .map(Duration::from_secs);

    let options = RunOptions {
        continue_on_failure,
        echo_output: exec.echo || config.execution.echo_output,
    };
    (options, timeout)
}

async fn execute(
    plan: &SweepPlan,
    options: RunOptions,
    timeout: Option<Duration>,
    runtime: TrainerRuntime,
    workspace: &Path,
    mut on_finished: impl FnMut(&RunRecord),
) -> anyhow::Result<SweepReport> {
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; stopping the current run");
                cancel.cancel();
            }
        })
    };

    let environment =
        EnvironmentSnapshot::capture().with_interpreter(runtime.interpreter_version().await);

    println!("Running {} run(s) from {}", plan.runs.len(), plan.source);
    let launcher = ProcessLauncher::new(runtime, timeout, cancel.clone());
    let runner = SweepRunner::new(launcher, options, cancel);
    let mut report = runner
        .run_with(plan, |record| {
            print_run_line(record);
            on_finished(record);
        })
        .await;
    ctrl_c.abort();

    report.environment = Some(environment);
    SweepHistory::append(&SweepHistory::default_path(workspace), report.clone())
        .context("Failed to record sweep history")?;
    print_summary(&report);
    Ok(report)
}

fn ensure_succeeded(report: &SweepReport) -> anyhow::Result<()> {
    if !report.succeeded() {
        let done = report.count(RunStatus::Completed);
        bail!("{} of {} runs did not complete", report.runs.len() - done, report.runs.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// output
// ---------------------------------------------------------------------------

fn print_plan(plan: &SweepPlan, runtime: &TrainerRuntime) {
    println!("Sweep '{}' from {} ({} runs)", plan.name, plan.source, plan.runs.len());

    for run in &plan.runs {
        let args = &run.args;
        println!(
            "\n[{}] {}  label={}  epochs={}",
            run.index + 1,
            args.name,
            args.label,
            args.epochs
        );
        if let Some(origin) = &run.origin {
            println!("    from:    {origin}");
        }
        println!("    run dir: {}", run.run_dir.display());

        let env: Vec<String> = run
            .env
            .iter()
            .map(|(k, v)| format!("{k}={}", quote(v)))
            .collect();
        let argv: Vec<String> = runtime.argv(args).iter().map(|t| quote(t)).collect();
        let command = env.into_iter().chain(argv).collect::<Vec<_>>().join(" ");
        println!("    command: {command}");

        if args.optuna {
            println!(
                "    search:  {} trainer-side trials, epochs {}..={}, lr {:e}..{:e} (no LR schedule)",
                args.optuna_ntrials,
                args.optuna_epoch_min,
                args.optuna_epoch_max,
                args.optuna_lr_min,
                args.optuna_lr_max
            );
            continue;
        }
        let milestones = StepLr::from_args(args).milestones(args.epochs);
        if milestones.is_empty() {
            println!("    lr:      {:e} (constant)", args.lr);
        } else {
            let steps: Vec<String> = milestones
                .iter()
                .map(|m| format!("{:e} @ epoch {}", m.lr, m.epoch))
                .collect();
            println!("    lr:      {:e}, then {}", args.lr, steps.join(", "));
        }
    }

    let duplicates = plan.duplicate_names();
    if !duplicates.is_empty() {
        println!(
            "\nnote: run names used more than once ({}); the trainer will suffix their directories",
            duplicates.join(", ")
        );
    }
}

fn print_run_line(record: &RunRecord) {
    let f1 = record
        .metrics
        .objective()
        .map(|f| format!("{f:.4}"))
        .unwrap_or_else(|| "-".to_string());
    let duration = record
        .duration_secs()
        .map(|d| format!("{d:.0}s"))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {:<10} {:<32} {:<7} best f1 {:<8} {}",
        record.status.to_string(),
        record.name,
        record.label.as_str(),
        f1,
        duration
    );
    if let Some(error) = &record.error {
        println!("             {error}");
    }
}

fn print_summary(report: &SweepReport) {
    println!(
        "\n{} completed, {} failed, {} timed out, {} cancelled, {} skipped",
        report.count(RunStatus::Completed),
        report.count(RunStatus::Failed),
        report.count(RunStatus::TimedOut),
        report.count(RunStatus::Cancelled),
        report.count(RunStatus::Skipped),
    );
    if let Some(best) = report.best_run() {
        println!(
            "Best run: {} (val f1 {:.4}) in {}",
            best.name,
            best.metrics.objective().unwrap_or_default(),
            best.run_dir.display()
        );
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

// ---------------------------------------------------------------------------
// history
// ---------------------------------------------------------------------------

fn handle_history(
    id: Option<String>,
    status: Option<RunStatus>,
    limit: usize,
    workspace: &Path,
) -> anyhow::Result<()> {
    let path = SweepHistory::default_path(workspace);
    let history = SweepHistory::load(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    if history.sweeps.is_empty() {
        println!("No sweeps recorded in {}", workspace.display());
        return Ok(());
    }

    if let Some(id) = id {
        let sweep = history
            .find(&id)
            .with_context(|| format!("No sweep with id '{id}'"))?;
        println!("Sweep {} '{}' from {}", sweep.id, sweep.name, sweep.source);
        println!("Started: {}", sweep.started_at.format("%Y-%m-%d %H:%M:%S"));
        if let Some(env) = &sweep.environment {
            println!(
                "Environment: {} {}",
                env.system_info,
                env.interpreter_version.as_deref().unwrap_or("(interpreter unknown)")
            );
        }
        for run in &sweep.runs {
            print_run_line(run);
            println!("             {}", run.run_dir.display());
            for artifact in &run.artifacts {
                println!(
                    "             {} {} bytes sha256:{}",
                    artifact.kind.file_name(),
                    artifact.size_bytes,
                    short_id(&artifact.sha256)
                );
            }
        }
        return Ok(());
    }

    if let Some(status) = status {
        let runs = history.runs_by_status(status);
        if runs.is_empty() {
            println!("No {status} runs.");
        }
        for (sweep, run) in runs.into_iter().take(limit) {
            println!(
                "{}  {:<24} {:<32} exit={}",
                short_id(&sweep.id),
                sweep.name,
                run.name,
                run.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
            );
        }
        return Ok(());
    }

    for sweep in history.sweeps.iter().rev().take(limit) {
        let best = sweep
            .best_run()
            .map(|r| {
                format!(
                    "  best {} ({:.4})",
                    r.name,
                    r.metrics.objective().unwrap_or_default()
                )
            })
            .unwrap_or_default();
        println!(
            "{}  {}  {:<24} {}/{} completed{}",
            short_id(&sweep.id),
            sweep.started_at.format("%Y-%m-%d %H:%M"),
            sweep.name,
            sweep.count(RunStatus::Completed),
            sweep.runs.len(),
            best
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn handle_config(action: ConfigAction, config: &SweepConfig, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let toml_str = toml::to_string_pretty(&SweepConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{toml_str}");
            Ok(())
        }
    }
}
