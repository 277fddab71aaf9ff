//! Trainer runtime: how a trainer invocation becomes a process.
//!
//! Resolves the interpreter (honouring a configured virtualenv), the trainer
//! script and the working directory, and exports the data/model locations the
//! trainer reads from its environment.

use crate::config::SweepConfig;
use crate::error::LaunchError;
use crate::invocation::TrainArgs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Environment variable the trainer reads its default model directory from.
const MODEL_DIR_VAR: &str = "SM_MODEL_DIR";

/// Information about the detected interpreter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterInfo {
    pub path: PathBuf,
    pub version: String,
}

/// Builds trainer commands.
#[derive(Debug, Clone)]
pub struct TrainerRuntime {
    python_path: PathBuf,
    venv_path: Option<PathBuf>,
    script: PathBuf,
    working_dir: PathBuf,
    data_dir: PathBuf,
    model_dir: PathBuf,
}

impl TrainerRuntime {
    pub fn new(config: &SweepConfig, workspace: &Path) -> Self {
        let working_dir = match &config.trainer.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => workspace.join(dir),
            None => workspace.to_path_buf(),
        };
        Self {
            python_path: config.trainer.python_path.clone(),
            venv_path: config.trainer.venv_path.clone(),
            script: config.trainer.script.clone(),
            working_dir,
            data_dir: config.paths.data_dir.clone(),
            model_dir: config.paths.model_dir.clone(),
        }
    }

    /// Effective interpreter (accounting for venv).
    pub fn python_cmd(&self) -> PathBuf {
        if let Some(venv) = &self.venv_path {
            let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
            venv.join(bin_dir).join("python")
        } else {
            self.python_path.clone()
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Model directory a run writes under, resolved against the working dir.
    ///
    /// `--model_dir` wins over a per-run `SM_MODEL_DIR`, which wins over the
    /// configured directory; the same order the trainer sees.
    pub fn model_dir_for(&self, args: &TrainArgs, env: &BTreeMap<String, String>) -> PathBuf {
        let dir = args
            .model_dir
            .as_deref()
            .or_else(|| env.get(MODEL_DIR_VAR).map(String::as_str))
            .map(PathBuf::from)
            .unwrap_or_else(|| self.model_dir.clone());
        if dir.is_absolute() {
            dir
        } else {
            self.working_dir.join(dir)
        }
    }

    /// Full argv as it would be typed: interpreter, script, flags.
    pub fn argv(&self, args: &TrainArgs) -> Vec<String> {
        let mut argv = vec![
            self.python_cmd().display().to_string(),
            self.script.display().to_string(),
        ];
        argv.extend(args.to_argv());
        argv
    }

    /// Environment handed to the trainer on top of the inherited one.
    pub fn env(&self, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "SM_CHANNEL_TRAIN".to_string(),
            self.data_dir.display().to_string(),
        );
        env.insert(
            MODEL_DIR_VAR.to_string(),
            self.model_dir.display().to_string(),
        );
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Build the trainer process command.
    pub fn command(&self, args: &TrainArgs, extra_env: &BTreeMap<String, String>) -> Command {
        let mut cmd = Command::new(self.python_cmd());
        cmd.arg(&self.script)
            .args(args.to_argv())
            .envs(self.env(extra_env))
            .current_dir(&self.working_dir)
            .kill_on_drop(true);
        debug!(
            program = %self.python_cmd().display(),
            script = %self.script.display(),
            name = %args.name,
            "Built trainer command"
        );
        cmd
    }

    /// Probe the configured interpreter for its version string.
    pub async fn interpreter_version(&self) -> Option<String> {
        version_of(&self.python_cmd()).await
    }

    /// Detect an available Python installation.
    pub async fn detect() -> Result<InterpreterInfo, LaunchError> {
        for cmd in ["python3", "python"] {
            let path = PathBuf::from(cmd);
            if let Some(version) = version_of(&path).await {
                return Ok(InterpreterInfo { path, version });
            }
        }
        Err(LaunchError::InterpreterNotFound {
            message: "neither python3 nor python is on PATH".to_string(),
        })
    }
}

async fn version_of(program: &Path) -> Option<String> {
    let output = Command::new(program)
        .arg("--version")
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    // Python 2 printed its version on stderr.
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let version = if stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    } else {
        stdout
    };
    (!version.is_empty()).then_some(version)
}
