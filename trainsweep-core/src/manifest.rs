//! TOML sweep manifests.
//!
//! ```toml
//! [sweep]
//! name = "effb4"
//! labels = ["mask", "gender", "age"]
//!
//! [base]
//! epochs = 30
//! model = "EfficientNet"
//! model_version = "b4"
//! resize = [380, 380]
//!
//! [grid]
//! lr = [1e-4, 5e-5]
//! ```
//!
//! Expansion order is explicit runs (or the base alone) × grid points ×
//! labels. A `[search]` block replaces `[[runs]]` and `[grid]` with seeded
//! random trials.

use crate::error::SweepError;
use crate::invocation::{Invocation, Label, TrainArgs};
use crate::training::sweep::{
    HyperparamSweep, Overrides, ParamDistribution, SweepStrategy, apply_overrides,
    default_search_space, grid_points,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// A parsed sweep manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub sweep: SweepSection,
    #[serde(default)]
    pub base: Overrides,
    #[serde(default)]
    pub runs: Vec<Overrides>,
    #[serde(default)]
    pub grid: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub search: Option<SearchSection>,
}

/// The `[sweep]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepSection {
    pub name: String,
    /// Fan every run out over these labels.
    #[serde(default)]
    pub labels: Vec<Label>,
    /// Run-name template with `{name}`, `{label}` and `{trial}` placeholders.
    #[serde(default)]
    pub name_template: Option<String>,
    /// Extra environment for every run.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Overrides `execution.continue_on_failure` for this sweep.
    #[serde(default)]
    pub continue_on_failure: Option<bool>,
    /// Overrides `trainer.timeout_secs` for this sweep.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// The `[search]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchSection {
    pub n_trials: usize,
    /// Defaults to the base run's seed.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Defaults to epochs, lr and optimizer.
    #[serde(default)]
    pub params: BTreeMap<String, ParamDistribution>,
}

/// A random search ready to run.
#[derive(Debug, Clone)]
pub struct SearchPlan {
    pub sweep: HyperparamSweep,
    /// One invocation per trial, in trial order.
    pub invocations: Vec<Invocation>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, SweepError> {
        let source = std::fs::read_to_string(path)?;
        Self::parse(&source)
    }

    pub fn parse(source: &str) -> Result<Self, SweepError> {
        let manifest: Manifest = toml::from_str(source)?;
        if manifest.sweep.name.trim().is_empty() {
            return Err(SweepError::manifest("[sweep] name must not be empty"));
        }
        Ok(manifest)
    }

    pub fn is_search(&self) -> bool {
        self.search.is_some()
    }

    fn base_args(&self) -> Result<TrainArgs, SweepError> {
        let mut base = self.base.clone();
        base.entry("name".to_string())
            .or_insert_with(|| Value::from(self.sweep.name.clone()));
        apply_overrides(&TrainArgs::default(), &base)
            .map_err(in_section("[base]".to_string()))
    }

    /// Expand into the ordered list of invocations.
    pub fn expand(&self) -> Result<Vec<Invocation>, SweepError> {
        if self.is_search() {
            return Ok(self.search_plan()?.invocations);
        }

        let base = self.base_args()?;
        let variants = if self.runs.is_empty() {
            vec![base]
        } else {
            self.runs
                .iter()
                .enumerate()
                .map(|(i, run)| {
                    apply_overrides(&base, run).map_err(in_section(format!("[[runs]] #{}", i + 1)))
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        if let Some(key) = self.grid.iter().find_map(|(k, v)| v.is_empty().then_some(k)) {
            return Err(SweepError::manifest(format!(
                "[grid] '{key}' needs at least one value"
            )));
        }
        let points = grid_points(&self.grid);
        let mut trials = Vec::with_capacity(variants.len() * points.len());
        for variant in &variants {
            for point in &points {
                trials.push(
                    apply_overrides(variant, point).map_err(in_section("[grid]".to_string()))?,
                );
            }
        }

        let invocations = self.fan_out(trials)?;
        ensure_unique_names(&invocations)?;
        Ok(invocations)
    }

    /// Build the random search described by `[search]`.
    pub fn search_plan(&self) -> Result<SearchPlan, SweepError> {
        let Some(search) = &self.search else {
            return Err(SweepError::manifest("manifest has no [search] table"));
        };
        if !self.runs.is_empty() || !self.grid.is_empty() {
            return Err(SweepError::manifest(
                "[search] cannot be combined with [[runs]] or [grid]",
            ));
        }
        if self.sweep.labels.len() > 1 {
            return Err(SweepError::manifest("[search] runs a single label"));
        }
        if search.n_trials == 0 {
            return Err(SweepError::manifest("[search] n_trials must be at least 1"));
        }

        let base = self.base_args()?;
        let params = if search.params.is_empty() {
            default_search_space()
        } else {
            search.params.clone()
        };
        let mut sweep = HyperparamSweep::new(
            &self.sweep.name,
            SweepStrategy::Random {
                params,
                n_trials: search.n_trials,
                seed: search.seed.unwrap_or(base.seed),
            },
        );

        let trials = sweep
            .generate_trials()?
            .iter()
            .map(|trial| {
                apply_overrides(&base, trial).map_err(in_section("[search]".to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let invocations = self.fan_out(trials)?;
        ensure_unique_names(&invocations)?;
        for (trial, invocation) in sweep.trials.iter_mut().zip(&invocations) {
            trial.run_name = Some(invocation.args.name.clone());
        }
        Ok(SearchPlan { sweep, invocations })
    }

    fn fan_out(&self, trials: Vec<TrainArgs>) -> Result<Vec<Invocation>, SweepError> {
        let labels: Vec<Option<Label>> = if self.sweep.labels.is_empty() {
            vec![None]
        } else {
            self.sweep.labels.iter().copied().map(Some).collect()
        };
        let multi_trial = trials.len() > 1;
        let template = self.sweep.name_template.clone().unwrap_or_else(|| {
            let mut t = "{name}".to_string();
            if !self.sweep.labels.is_empty() {
                t.push_str("_{label}");
            }
            if multi_trial {
                t.push_str("_{trial}");
            }
            t
        });

        let mut invocations = Vec::with_capacity(trials.len() * labels.len());
        for (trial, args) in trials.into_iter().enumerate() {
            for label in &labels {
                let mut args = args.clone();
                if let Some(label) = label {
                    args.label = *label;
                }
                args.name = template
                    .replace("{name}", &args.name)
                    .replace("{label}", args.label.as_str())
                    .replace("{trial}", &trial.to_string());
                args.ensure_valid()?;

                let mut invocation = Invocation::new(args);
                invocation.env = self.sweep.env.clone();
                invocations.push(invocation);
            }
        }
        Ok(invocations)
    }
}

fn in_section(section: String) -> impl Fn(SweepError) -> SweepError {
    move |e| match e {
        SweepError::Manifest { message } => SweepError::manifest(format!("{section}: {message}")),
        other => other,
    }
}

fn ensure_unique_names(invocations: &[Invocation]) -> Result<(), SweepError> {
    let mut seen = BTreeSet::new();
    for invocation in invocations {
        if !seen.insert(invocation.args.name.as_str()) {
            return Err(SweepError::manifest(format!(
                "run name '{}' is produced more than once; add {{label}} or {{trial}} to name_template",
                invocation.args.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const EFFB4: &str = r#"
[sweep]
name = "effb4"
labels = ["mask", "gender", "age"]

[sweep.env]
CUDA_VISIBLE_DEVICES = "0"

[base]
epochs = 30
dataset = "MaskSplitByProfileDataset"
augmentation = "CustomAugmentation"
resize = [380, 380]
lr = 1e-4
lr_decay_step = 10
lr_gamma = 0.5
batch_size = 32
valid_batch_size = 128
model = "EfficientNet"
model_version = "b4"
optimizer = "AdamW"
criterion = "focal"
log_interval = 20
"#;

    fn names(invocations: &[Invocation]) -> Vec<String> {
        invocations.iter().map(|i| i.args.name.clone()).collect()
    }

    #[test]
    fn test_label_fan_out() {
        let manifest = Manifest::parse(EFFB4).unwrap();
        let invocations = manifest.expand().unwrap();
        assert_eq!(names(&invocations), vec!["effb4_mask", "effb4_gender", "effb4_age"]);

        let labels: Vec<Label> = invocations.iter().map(|i| i.args.label).collect();
        assert_eq!(labels, vec![Label::Mask, Label::Gender, Label::Age]);
        assert_eq!(invocations[0].args.resize.height(), 380);
        assert_eq!(invocations[2].args.criterion, "focal");
        assert_eq!(invocations[1].env["CUDA_VISIBLE_DEVICES"], "0");
    }

    #[test]
    fn test_runs_times_grid_times_labels() {
        let source = format!(
            "{EFFB4}\n[[runs]]\noptimizer = \"AdamW\"\n\n[[runs]]\noptimizer = \"SGD\"\n\n[grid]\nlr = [1e-4, 1e-5]\n"
        );
        let invocations = Manifest::parse(&source).unwrap().expand().unwrap();
        assert_eq!(invocations.len(), 12);
        assert_eq!(invocations[0].args.name, "effb4_mask_0");
        assert_eq!(invocations[0].args.optimizer, "AdamW");
        assert_eq!(invocations[3].args.name, "effb4_mask_1");
        assert_eq!(invocations[3].args.lr, 1e-5);
        assert_eq!(invocations[6].args.optimizer, "SGD");
        assert_eq!(invocations[11].args.name, "effb4_age_3");
    }

    #[test]
    fn test_unknown_base_field_rejected() {
        let source = "[sweep]\nname = \"x\"\n[base]\nwarmup_epochs = 3\n";
        let err = Manifest::parse(source).unwrap().expand().unwrap_err();
        assert!(err.to_string().contains("warmup_epochs"), "{err}");
    }

    #[test]
    fn test_unknown_top_level_table_rejected() {
        assert!(Manifest::parse("[sweep]\nname = \"x\"\n[extra]\na = 1\n").is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let source = "[sweep]\nname = \"x\"\nname_template = \"fixed\"\n[grid]\nlr = [0.1, 0.01]\n";
        let err = Manifest::parse(source).unwrap().expand().unwrap_err();
        assert!(err.to_string().contains("'fixed'"));
    }

    #[test]
    fn test_invalid_value_rejected() {
        let source = "[sweep]\nname = \"x\"\n[grid]\nbatch_size = [32, 0]\n";
        assert!(matches!(
            Manifest::parse(source).unwrap().expand(),
            Err(SweepError::Validation { .. })
        ));
    }

    #[test]
    fn test_empty_grid_list_rejected() {
        let source = "[sweep]\nname = \"x\"\n[grid]\nlr = []\nbatch_size = [32]\n";
        let err = Manifest::parse(source).unwrap().expand().unwrap_err();
        assert!(err.to_string().contains("'lr' needs at least one value"), "{err}");
    }

    #[test]
    fn test_search_with_unbounded_param_is_an_error() {
        let source = "[sweep]\nname = \"t\"\n[search]\nn_trials = 2\n\n[search.params.lr]\ntype = \"uniform\"\nmin = 0.0\nmax = inf\n";
        let manifest = Manifest::parse(source).unwrap();
        assert!(matches!(manifest.search_plan(), Err(SweepError::Manifest { .. })));
        assert!(manifest.expand().is_err());
    }

    #[test]
    fn test_search_plan() {
        let source = "[sweep]\nname = \"tune\"\nlabels = [\"age\"]\n[base]\nseed = 7\n[search]\nn_trials = 4\n";
        let manifest = Manifest::parse(source).unwrap();
        let plan = manifest.search_plan().unwrap();
        assert_eq!(plan.invocations.len(), 4);
        assert_eq!(names(&plan.invocations), vec!["tune_age_0", "tune_age_1", "tune_age_2", "tune_age_3"]);
        assert!(plan.invocations.iter().all(|i| i.args.label == Label::Age));
        assert_eq!(plan.sweep.trials[2].run_name.as_deref(), Some("tune_age_2"));

        let again = manifest.search_plan().unwrap();
        let lrs = |p: &SearchPlan| p.invocations.iter().map(|i| i.args.lr).collect::<Vec<_>>();
        assert_eq!(lrs(&plan), lrs(&again));
        assert_eq!(manifest.expand().unwrap().len(), 4);
    }

    #[test]
    fn test_search_rejects_label_fan_out_and_grid() {
        let fan = "[sweep]\nname = \"t\"\nlabels = [\"age\", \"mask\"]\n[search]\nn_trials = 2\n";
        assert!(Manifest::parse(fan).unwrap().search_plan().is_err());

        let grid = "[sweep]\nname = \"t\"\n[grid]\nlr = [0.1]\n[search]\nn_trials = 2\n";
        assert!(Manifest::parse(grid).unwrap().search_plan().is_err());
    }
}
