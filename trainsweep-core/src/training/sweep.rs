//! Sweep planning: grid expansion, random search, and the ordered plan the
//! runner executes.

use super::run_dir::RunDirPlanner;
use crate::error::SweepError;
use crate::invocation::{Invocation, Label, Origin, TrainArgs};
use crate::runtime::TrainerRuntime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Flag overrides applied on top of a base [`TrainArgs`].
pub type Overrides = BTreeMap<String, Value>;

/// Sweep strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SweepStrategy {
    Grid {
        params: BTreeMap<String, Vec<Value>>,
    },
    Random {
        params: BTreeMap<String, ParamDistribution>,
        n_trials: usize,
        seed: u64,
    },
}

/// Parameter distribution for random search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamDistribution {
    Uniform { min: f64, max: f64 },
    LogUniform { min: f64, max: f64 },
    Choice { values: Vec<Value> },
    IntRange { min: i64, max: i64 },
}

impl ParamDistribution {
    fn check(&self, name: &str) -> Result<(), SweepError> {
        let bad = |why: &str| Err(SweepError::manifest(format!("search param '{name}': {why}")));
        match self {
            ParamDistribution::Uniform { min, max } | ParamDistribution::LogUniform { min, max }
                if !(max - min).is_finite() =>
            {
                bad("min and max must be finite")
            }
            ParamDistribution::Uniform { min, max } if min > max => bad("min must be <= max"),
            ParamDistribution::LogUniform { min, max } if !(*min > 0.0 && min <= max) => {
                bad("log_uniform needs 0 < min <= max")
            }
            ParamDistribution::Choice { values } if values.is_empty() => {
                bad("choice needs at least one value")
            }
            ParamDistribution::IntRange { min, max } if min > max => bad("min must be <= max"),
            _ => Ok(()),
        }
    }

    fn sample(&self, rng: &mut StdRng) -> Value {
        match self {
            ParamDistribution::Uniform { min, max } => {
                if min < max {
                    Value::from(rng.gen_range(*min..*max))
                } else {
                    Value::from(*min)
                }
            }
            ParamDistribution::LogUniform { min, max } => {
                let (lo, hi) = (min.ln(), max.ln());
                if lo < hi {
                    Value::from(rng.gen_range(lo..hi).exp())
                } else {
                    Value::from(*min)
                }
            }
            ParamDistribution::Choice { values } => {
                values[rng.gen_range(0..values.len())].clone()
            }
            ParamDistribution::IntRange { min, max } => Value::from(rng.gen_range(*min..=*max)),
        }
    }
}

/// The trainer's built-in search space: epochs, learning rate and optimizer.
pub fn default_search_space() -> BTreeMap<String, ParamDistribution> {
    let optimizers = ["Adadelta", "AdamW", "SGD", "RMSprop", "Adam", "Adagrad"];
    BTreeMap::from([
        (
            "epochs".to_string(),
            ParamDistribution::IntRange { min: 3, max: 5 },
        ),
        (
            "lr".to_string(),
            ParamDistribution::LogUniform {
                min: 1e-5,
                max: 1e-2,
            },
        ),
        (
            "optimizer".to_string(),
            ParamDistribution::Choice {
                values: optimizers.iter().map(|o| Value::from(*o)).collect(),
            },
        ),
    ])
}

/// A hyperparameter sweep and its trial results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperparamSweep {
    pub id: String,
    pub name: String,
    pub strategy: SweepStrategy,
    pub trials: Vec<SweepTrial>,
    pub best_trial: Option<usize>,
}

/// A single sweep trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepTrial {
    pub trial_number: usize,
    pub params: Overrides,
    pub run_name: Option<String>,
    pub metric: Option<f64>,
    pub status: String,
}

impl HyperparamSweep {
    pub fn new(name: &str, strategy: SweepStrategy) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            strategy,
            trials: Vec::new(),
            best_trial: None,
        }
    }

    /// Generate trial configurations and register them as pending trials.
    pub fn generate_trials(&mut self) -> Result<Vec<Overrides>, SweepError> {
        let configs = match &self.strategy {
            SweepStrategy::Grid { params } => grid_points(params),
            SweepStrategy::Random {
                params,
                n_trials,
                seed,
            } => {
                for (name, dist) in params {
                    dist.check(name)?;
                }
                let mut rng = StdRng::seed_from_u64(*seed);
                (0..*n_trials)
                    .map(|_| {
                        params
                            .iter()
                            .map(|(key, dist)| (key.clone(), dist.sample(&mut rng)))
                            .collect()
                    })
                    .collect()
            }
        };

        self.trials = configs
            .iter()
            .enumerate()
            .map(|(trial_number, params)| SweepTrial {
                trial_number,
                params: params.clone(),
                run_name: None,
                metric: None,
                status: "pending".to_string(),
            })
            .collect();
        self.best_trial = None;
        Ok(configs)
    }

    /// Record a trial outcome; the best trial maximises the metric.
    pub fn record(&mut self, trial_number: usize, metric: Option<f64>, status: &str) {
        let Some(trial) = self.trials.get_mut(trial_number) else {
            return;
        };
        trial.metric = metric.filter(|m| m.is_finite());
        trial.status = status.to_string();

        if let Some(value) = trial.metric {
            let better = self
                .best_trial
                .and_then(|idx| self.trials[idx].metric)
                .is_none_or(|best| value > best);
            if better {
                self.best_trial = Some(trial_number);
            }
        }
    }

    pub fn best(&self) -> Option<&SweepTrial> {
        self.best_trial.and_then(|idx| self.trials.get(idx))
    }

    /// Write the best trial to `<dir>/search_<name>_<value>.json`.
    pub fn write_best(&self, dir: &Path) -> Result<Option<PathBuf>, SweepError> {
        let Some(best) = self.best() else {
            return Ok(None);
        };
        let value = best.metric.unwrap_or_default();
        let path = dir.join(format!("search_{}_{:.4}.json", self.name, value));
        let body = serde_json::json!({
            "sweep_id": self.id,
            "value": value,
            "trial_number": best.trial_number,
            "run_name": best.run_name,
            "params": best.params,
        });
        crate::persistence::atomic_write_json(&path, &body)?;
        Ok(Some(path))
    }
}

/// Cartesian product of a parameter grid, in sorted key order.
pub fn grid_points(params: &BTreeMap<String, Vec<Value>>) -> Vec<Overrides> {
    let mut points = vec![Overrides::new()];
    for (key, values) in params {
        let mut next = Vec::with_capacity(points.len() * values.len());
        for point in &points {
            for value in values {
                let mut p = point.clone();
                p.insert(key.clone(), value.clone());
                next.push(p);
            }
        }
        points = next;
    }
    points
}

/// Apply flag overrides to `base`; unknown flags and mistyped values are errors.
pub fn apply_overrides(base: &TrainArgs, overrides: &Overrides) -> Result<TrainArgs, SweepError> {
    if overrides.is_empty() {
        return Ok(base.clone());
    }
    let mut value = serde_json::to_value(base)?;
    let Value::Object(map) = &mut value else {
        return Err(SweepError::manifest("train arguments must serialize to an object"));
    };
    for (key, v) in overrides {
        map.insert(key.clone(), v.clone());
    }
    serde_json::from_value(value)
        .map_err(|e| SweepError::manifest(format!("invalid override: {e}")))
}

/// One run of a plan, ready to launch.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub index: usize,
    pub args: TrainArgs,
    pub env: BTreeMap<String, String>,
    /// Where the trainer is expected to write this run.
    pub run_dir: PathBuf,
    pub origin: Option<Origin>,
}

/// An ordered, validated list of runs.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    pub name: String,
    pub source: String,
    pub runs: Vec<PlannedRun>,
}

impl SweepPlan {
    /// Like [`SweepPlan::build`], keeping only invocations whose label is in
    /// `only` (all of them when empty). Filtering happens before directories
    /// are predicted, so dropped runs never claim one.
    pub fn build_only(
        name: &str,
        source: &str,
        mut invocations: Vec<Invocation>,
        only: &[Label],
        runtime: &TrainerRuntime,
    ) -> Result<Self, SweepError> {
        if !only.is_empty() {
            invocations.retain(|i| only.contains(&i.args.label));
        }
        Self::build(name, source, invocations, runtime)
    }

    /// Validate `invocations` and predict each run's output directory.
    pub fn build(
        name: &str,
        source: &str,
        invocations: Vec<Invocation>,
        runtime: &TrainerRuntime,
    ) -> Result<Self, SweepError> {
        let mut planner = RunDirPlanner::new();
        let mut runs = Vec::with_capacity(invocations.len());

        for (index, invocation) in invocations.into_iter().enumerate() {
            invocation.args.ensure_valid()?;
            let model_dir = runtime.model_dir_for(&invocation.args, &invocation.env);
            let (name, exist_ok) = (&invocation.args.name, invocation.args.exist_ok);
            let run_dir = planner.claim(&model_dir, name, exist_ok);
            // Trainer-side search trials each take a directory of their own.
            for _ in 1..invocation.args.trainer_passes() {
                planner.claim(&model_dir, name, exist_ok);
            }
            runs.push(PlannedRun {
                index,
                args: invocation.args,
                env: invocation.env,
                run_dir,
                origin: invocation.origin,
            });
        }

        Ok(Self {
            name: name.to_string(),
            source: source.to_string(),
            runs,
        })
    }

    /// Run names used more than once in this plan.
    pub fn duplicate_names(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut dups = BTreeSet::new();
        for run in &self.runs {
            if !seen.insert(run.args.name.as_str()) {
                dups.insert(run.args.name.clone());
            }
        }
        dups.into_iter().collect()
    }
}
