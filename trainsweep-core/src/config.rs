//! Configuration system for trainsweep.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> environment -> explicit file. Configuration is loaded
//! from `~/.config/trainsweep/config.toml` and/or `.trainsweep/config.toml`
//! in the workspace directory.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory inside the workspace holding config and the sweep ledger.
pub const WORKSPACE_DIR: &str = ".trainsweep";

/// Top-level launcher configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepConfig {
    /// How the trainer process is started.
    #[serde(default)]
    pub trainer: TrainerConfig,
    /// Data and model locations handed to the trainer.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Sweep execution policy.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Log file settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Trainer process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Interpreter used to run the trainer script.
    #[serde(default = "default_python_path")]
    pub python_path: PathBuf,
    /// Virtual environment; when set, `<venv>/bin/python` is used instead.
    #[serde(default)]
    pub venv_path: Option<PathBuf>,
    /// Trainer entry point, relative to `working_dir`.
    #[serde(default = "default_script")]
    pub script: PathBuf,
    /// Directory the trainer runs in (defaults to the workspace).
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Per-run wall-clock limit in seconds. Unset means no limit.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            python_path: default_python_path(),
            venv_path: None,
            script: default_script(),
            working_dir: None,
            timeout_secs: None,
        }
    }
}

impl TrainerConfig {
    /// File name of the trainer script, as matched in driver scripts.
    pub fn script_name(&self) -> String {
        self.script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "train.py".to_string())
    }
}

fn default_python_path() -> PathBuf {
    PathBuf::from("python3")
}

fn default_script() -> PathBuf {
    PathBuf::from("train.py")
}

/// Data and model locations.
///
/// Defaults follow the trainer's container convention: `SM_CHANNEL_TRAIN`
/// and `SM_MODEL_DIR`, falling back to the trainer's own defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            model_dir: default_model_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("SM_CHANNEL_TRAIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/opt/ml/input/data/train/images"))
}

fn default_model_dir() -> PathBuf {
    std::env::var_os("SM_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./model"))
}

/// Sweep execution policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Keep going after a run fails instead of skipping the rest.
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Mirror trainer stdout/stderr to the terminal.
    #[serde(default)]
    pub echo_output: bool,
}

/// Log file settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for JSON log files (defaults to the platform data dir).
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "trainsweep", "trainsweep")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Workspace-level config file path.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(WORKSPACE_DIR).join("config.toml")
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit config file (`--config`)
/// 2. Environment variables (prefixed with `TRAINSWEEP_`, `__` between sections)
/// 3. Workspace-local config (`.trainsweep/config.toml`)
/// 4. User config (`~/.config/trainsweep/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<SweepConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(SweepConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // TRAINSWEEP_TRAINER__SCRIPT, TRAINSWEEP_EXECUTION__CONTINUE_ON_FAILURE, ...
    figment = figment.merge(Env::prefixed("TRAINSWEEP_").split("__"));

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SweepConfig::default();
        assert_eq!(config.trainer.python_path, PathBuf::from("python3"));
        assert_eq!(config.trainer.script_name(), "train.py");
        assert!(config.trainer.timeout_secs.is_none());
        assert!(!config.execution.continue_on_failure);
    }

    #[test]
    fn test_workspace_config_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = workspace_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"
[trainer]
script = "code/train.py"
timeout_secs = 7200

[execution]
continue_on_failure = true
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.trainer.script, PathBuf::from("code/train.py"));
        assert_eq!(config.trainer.script_name(), "train.py");
        assert_eq!(config.trainer.timeout_secs, Some(7200));
        assert!(config.execution.continue_on_failure);
        assert_eq!(config.trainer.python_path, PathBuf::from("python3"));
    }

    #[test]
    fn test_explicit_file_wins_over_workspace() {
        let dir = TempDir::new().unwrap();
        let ws = workspace_config_path(dir.path());
        std::fs::create_dir_all(ws.parent().unwrap()).unwrap();
        std::fs::write(&ws, "[trainer]\npython_path = \"python3.10\"\n").unwrap();

        let explicit = dir.path().join("ci.toml");
        std::fs::write(&explicit, "[trainer]\npython_path = \"/usr/bin/python3.11\"\n").unwrap();

        let config = load_config(Some(dir.path()), Some(&explicit)).unwrap();
        assert_eq!(
            config.trainer.python_path,
            PathBuf::from("/usr/bin/python3.11")
        );
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = load_config(None, Some(Path::new("/nonexistent/trainsweep.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = SweepConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: SweepConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.trainer.script, config.trainer.script);
        assert_eq!(parsed.paths.model_dir, config.paths.model_dir);
    }
}
