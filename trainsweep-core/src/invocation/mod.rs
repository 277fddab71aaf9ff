//! The trainer invocation model.
//!
//! [`TrainArgs`] holds one complete set of trainer flags with the trainer's
//! own defaults. Serialized field names equal the flag names, so the JSON
//! form matches the `config.json` the trainer writes into its run directory.

pub mod flags;
pub mod script;

use crate::error::SweepError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use flags::{REQUIRED_FLAGS, parse_argv};
pub use script::{DriverScript, SkippedCommand, read_script};

/// Classification target of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Mask,
    Gender,
    Age,
    /// All three targets combined into one 18-class label.
    Total,
}

impl Label {
    pub const ALL: [Label; 4] = [Label::Mask, Label::Gender, Label::Age, Label::Total];

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Mask => "mask",
            Label::Gender => "gender",
            Label::Age => "age",
            Label::Total => "total",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mask" => Ok(Label::Mask),
            "gender" => Ok(Label::Gender),
            "age" => Ok(Label::Age),
            "total" => Ok(Label::Total),
            other => Err(format!(
                "unknown label '{other}' (expected mask, gender, age or total)"
            )),
        }
    }
}

/// Image resize target, `H W`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize(pub u32, pub u32);

impl Resize {
    pub fn height(&self) -> u32 {
        self.0
    }

    pub fn width(&self) -> u32 {
        self.1
    }
}

impl Default for Resize {
    fn default() -> Self {
        Resize(512, 384)
    }
}

impl fmt::Display for Resize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.0, self.1)
    }
}

/// One complete set of trainer flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainArgs {
    pub seed: u64,
    pub epochs: u32,
    pub dataset: String,
    pub label: Label,
    pub augmentation: String,
    pub resize: Resize,
    pub batch_size: u32,
    pub valid_batch_size: u32,
    pub model: String,
    pub optimizer: String,
    pub lr: f64,
    pub val_ratio: f64,
    pub criterion: String,
    pub lr_decay_step: u32,
    pub lr_gamma: f64,
    pub log_interval: u32,
    pub name: String,
    pub model_version: String,
    /// CutMix beta; non-positive disables it.
    pub beta: f64,
    pub cpu: bool,
    /// TensorBoard logging.
    pub tb: bool,
    /// Trainer-side search: the trainer runs `optuna_ntrials` trainings in one
    /// process, sampling epochs, lr and optimizer, with the LR schedule off.
    pub optuna: bool,
    pub optuna_ntrials: u32,
    pub optuna_epoch_min: u32,
    pub optuna_epoch_max: u32,
    pub optuna_lr_min: f64,
    pub optuna_lr_max: f64,
    /// The trainer declares this list as floats, so its parser rejects
    /// optimizer names; only its built-in list is usable. `None` keeps it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optuna_optimizer: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_params: Option<String>,
    pub exist_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<String>,
}

impl Default for TrainArgs {
    fn default() -> Self {
        Self {
            seed: 42,
            epochs: 1,
            dataset: "MaskSplitByProfileDataset".to_string(),
            label: Label::Total,
            augmentation: "get_transforms".to_string(),
            resize: Resize::default(),
            batch_size: 64,
            valid_batch_size: 64,
            model: "BaseModel".to_string(),
            optimizer: "SGD".to_string(),
            lr: 1e-3,
            val_ratio: 0.2,
            criterion: "cross_entropy".to_string(),
            lr_decay_step: 20,
            lr_gamma: 0.5,
            log_interval: 20,
            name: "exp".to_string(),
            model_version: "b0".to_string(),
            beta: -1.0,
            cpu: false,
            tb: true,
            optuna: false,
            optuna_ntrials: 10,
            optuna_epoch_min: 3,
            optuna_epoch_max: 5,
            optuna_lr_min: 1e-5,
            optuna_lr_max: 1e-2,
            optuna_optimizer: None,
            load_params: None,
            exist_ok: false,
            data_dir: None,
            model_dir: None,
        }
    }
}

impl TrainArgs {
    /// Check value ranges and identifier shapes, returning every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (flag, value) in [
            ("epochs", self.epochs),
            ("batch_size", self.batch_size),
            ("valid_batch_size", self.valid_batch_size),
            ("log_interval", self.log_interval),
            ("lr_decay_step", self.lr_decay_step),
        ] {
            if value == 0 {
                problems.push(format!("{flag} must be >= 1"));
            }
        }

        if !self.lr.is_finite() || self.lr <= 0.0 {
            problems.push(format!("lr must be a positive finite float, got {}", self.lr));
        }
        if !self.lr_gamma.is_finite() || self.lr_gamma <= 0.0 || self.lr_gamma > 1.0 {
            problems.push(format!("lr_gamma must be in (0, 1], got {}", self.lr_gamma));
        }
        if !self.val_ratio.is_finite() || self.val_ratio <= 0.0 || self.val_ratio >= 1.0 {
            problems.push(format!("val_ratio must be in (0, 1), got {}", self.val_ratio));
        }
        if !self.beta.is_finite() {
            problems.push("beta must be finite".to_string());
        }
        if self.optuna {
            if self.optuna_ntrials == 0 {
                problems.push("optuna_ntrials must be >= 1".to_string());
            }
            if self.optuna_epoch_min == 0 || self.optuna_epoch_min > self.optuna_epoch_max {
                problems.push(format!(
                    "optuna epochs need 1 <= min <= max, got {}..{}",
                    self.optuna_epoch_min, self.optuna_epoch_max
                ));
            }
            let (lo, hi) = (self.optuna_lr_min, self.optuna_lr_max);
            if !(lo.is_finite() && hi.is_finite() && lo > 0.0 && lo <= hi) {
                problems.push(format!("optuna lr needs 0 < min <= max, got {lo}..{hi}"));
            }
        }
        if self.optuna_optimizer.as_ref().is_some_and(|list| list.is_empty()) {
            problems.push("optuna_optimizer needs at least one value".to_string());
        }
        if self.resize.height() == 0 || self.resize.width() == 0 {
            problems.push(format!("resize must be two positive integers, got {}", self.resize));
        }

        for (flag, value) in [
            ("dataset", &self.dataset),
            ("augmentation", &self.augmentation),
            ("model", &self.model),
            ("model_version", &self.model_version),
            ("optimizer", &self.optimizer),
            ("criterion", &self.criterion),
        ] {
            if value.is_empty() {
                problems.push(format!("{flag} must not be empty"));
            } else if value.chars().any(char::is_whitespace) {
                problems.push(format!("{flag} must not contain whitespace: '{value}'"));
            }
        }

        if self.name.is_empty() {
            problems.push("name must not be empty".to_string());
        } else if self.name.contains('/') || self.name.contains('\\') {
            problems.push(format!("name must not contain path separators: '{}'", self.name));
        }

        problems
    }

    /// Like [`validate`](Self::validate) but as a `Result`.
    pub fn ensure_valid(&self) -> Result<(), SweepError> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SweepError::Validation {
                name: self.name.clone(),
                problems,
            })
        }
    }

    /// Number of trainings the trainer runs for this invocation; each one
    /// gets its own run directory.
    pub fn trainer_passes(&self) -> u32 {
        if self.optuna { self.optuna_ntrials.max(1) } else { 1 }
    }

    /// Canonical trainer argv (without interpreter and script).
    pub fn to_argv(&self) -> Vec<String> {
        flags::encode(self)
    }

    /// Render the argv as a single shell-safe line.
    pub fn to_command_line(&self) -> String {
        self.to_argv()
            .iter()
            .map(|t| script::quote(t))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Where an invocation came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub path: PathBuf,
    pub line: usize,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path.display(), self.line)
    }
}

/// A decoded trainer invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Invocation {
    pub args: TrainArgs,
    /// Flags that were given explicitly (the rest are trainer defaults).
    pub explicit: BTreeSet<String>,
    /// `VAR=value` assignments preceding the command.
    pub env: BTreeMap<String, String>,
    pub origin: Option<Origin>,
}

impl Invocation {
    pub fn new(args: TrainArgs) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }

    /// Required flags that were not given explicitly.
    pub fn missing_required(&self) -> Vec<&'static str> {
        REQUIRED_FLAGS
            .iter()
            .copied()
            .filter(|flag| !self.explicit.contains(*flag))
            .collect()
    }

    /// All problems with this invocation: missing required flags and invalid values.
    pub fn check(&self) -> Vec<String> {
        let mut problems: Vec<String> = self
            .missing_required()
            .into_iter()
            .map(|flag| format!("missing required flag --{flag}"))
            .collect();
        problems.extend(self.args.validate());
        problems
    }
}
