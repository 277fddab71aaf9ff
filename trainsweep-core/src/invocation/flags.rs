//! Trainer flag codec.
//!
//! Decodes argparse-style argv (`--flag value`, `--flag=value`,
//! `--resize H W`) into an [`Invocation`] and encodes [`TrainArgs`] back into
//! a canonical argv.

use super::{Invocation, Label, Resize, TrainArgs};
use crate::error::FlagError;
use tracing::warn;

/// Flags every driver-script invocation must spell out.
pub const REQUIRED_FLAGS: &[&str] = &[
    "epochs",
    "dataset",
    "label",
    "augmentation",
    "resize",
    "lr",
    "lr_decay_step",
    "lr_gamma",
    "batch_size",
    "valid_batch_size",
    "model",
    "model_version",
    "optimizer",
    "criterion",
    "log_interval",
    "name",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagKind {
    Int,
    Float,
    Text,
    Label,
    Resize,
    /// Bare `--flag` or `--flag <bool>`.
    Switch,
    /// argparse `type=bool`: one value, true unless empty.
    Truthy,
    /// One or more floats.
    FloatList,
}

const FLAGS: &[(&str, FlagKind)] = &[
    ("seed", FlagKind::Int),
    ("epochs", FlagKind::Int),
    ("dataset", FlagKind::Text),
    ("label", FlagKind::Label),
    ("augmentation", FlagKind::Text),
    ("resize", FlagKind::Resize),
    ("batch_size", FlagKind::Int),
    ("valid_batch_size", FlagKind::Int),
    ("model", FlagKind::Text),
    ("optimizer", FlagKind::Text),
    ("lr", FlagKind::Float),
    ("val_ratio", FlagKind::Float),
    ("criterion", FlagKind::Text),
    ("lr_decay_step", FlagKind::Int),
    ("lr_gamma", FlagKind::Float),
    ("log_interval", FlagKind::Int),
    ("name", FlagKind::Text),
    ("model_version", FlagKind::Text),
    ("beta", FlagKind::Float),
    ("cpu", FlagKind::Truthy),
    ("tb", FlagKind::Truthy),
    ("optuna", FlagKind::Truthy),
    ("optuna_ntrials", FlagKind::Int),
    ("optuna_epoch_min", FlagKind::Int),
    ("optuna_epoch_max", FlagKind::Int),
    ("optuna_lr_min", FlagKind::Float),
    ("optuna_lr_max", FlagKind::Float),
    ("optuna_optimizer", FlagKind::FloatList),
    ("load_params", FlagKind::Text),
    ("exist_ok", FlagKind::Switch),
    ("data_dir", FlagKind::Text),
    ("model_dir", FlagKind::Text),
];

fn kind_of(flag: &str) -> Option<FlagKind> {
    FLAGS.iter().find(|(name, _)| *name == flag).map(|(_, k)| *k)
}

/// Whether `flag` is a trainer flag this codec understands.
pub fn is_known_flag(flag: &str) -> bool {
    kind_of(flag).is_some()
}

fn is_flag_token(token: &str) -> bool {
    token.starts_with("--")
}

/// Decode trainer argv into an [`Invocation`].
///
/// Values for a flag are every token up to the next `--` token, which is how
/// argparse reads `nargs="+"`; scalar flags then insist on exactly one.
pub fn parse_argv<S: AsRef<str>>(tokens: &[S]) -> Result<Invocation, FlagError> {
    let mut inv = Invocation::default();
    let mut i = 0;

    while i < tokens.len() {
        let token = tokens[i].as_ref();
        let Some(body) = token.strip_prefix("--") else {
            return Err(FlagError::Positional {
                token: token.to_string(),
            });
        };

        let (flag, inline) = match body.split_once('=') {
            Some((flag, value)) => (flag, Some(value)),
            None => (body, None),
        };
        let kind = kind_of(flag).ok_or_else(|| FlagError::Unknown {
            flag: format!("--{flag}"),
        })?;
        if !inv.explicit.insert(flag.to_string()) {
            return Err(FlagError::Duplicate {
                flag: flag.to_string(),
            });
        }

        let mut values: Vec<&str> = Vec::new();
        i += 1;
        if let Some(value) = inline {
            values.push(value);
        } else {
            while i < tokens.len() && !is_flag_token(tokens[i].as_ref()) {
                values.push(tokens[i].as_ref());
                i += 1;
            }
        }

        apply(&mut inv.args, flag, kind, &values)?;
    }

    Ok(inv)
}

fn apply(args: &mut TrainArgs, flag: &str, kind: FlagKind, values: &[&str]) -> Result<(), FlagError> {
    match kind {
        FlagKind::Resize => {
            if values.len() != 2 {
                return Err(FlagError::ResizeArity {
                    count: values.len(),
                });
            }
            args.resize = Resize(
                parse_int(flag, values[0])?,
                parse_int(flag, values[1])?,
            );
            return Ok(());
        }
        FlagKind::Switch => {
            args.exist_ok = match values {
                [] => true,
                [value] => parse_bool(flag, value)?,
                [_, extra, ..] => {
                    return Err(FlagError::Positional {
                        token: extra.to_string(),
                    });
                }
            };
            return Ok(());
        }
        FlagKind::FloatList => {
            if values.is_empty() {
                return Err(FlagError::MissingValue {
                    flag: flag.to_string(),
                });
            }
            let list = values
                .iter()
                .map(|v| parse_float(flag, v))
                .collect::<Result<Vec<_>, _>>()?;
            args.optuna_optimizer = Some(list);
            return Ok(());
        }
        _ => {}
    }

    let value = match values {
        [] => {
            return Err(FlagError::MissingValue {
                flag: flag.to_string(),
            });
        }
        [value] => *value,
        [_, extra, ..] => {
            return Err(FlagError::Positional {
                token: extra.to_string(),
            });
        }
    };

    match flag {
        "seed" => args.seed = parse_int(flag, value)?,
        "epochs" => args.epochs = parse_int(flag, value)?,
        "batch_size" => args.batch_size = parse_int(flag, value)?,
        "valid_batch_size" => args.valid_batch_size = parse_int(flag, value)?,
        "lr_decay_step" => args.lr_decay_step = parse_int(flag, value)?,
        "log_interval" => args.log_interval = parse_int(flag, value)?,
        "lr" => args.lr = parse_float(flag, value)?,
        "val_ratio" => args.val_ratio = parse_float(flag, value)?,
        "lr_gamma" => args.lr_gamma = parse_float(flag, value)?,
        "beta" => args.beta = parse_float(flag, value)?,
        "optuna_ntrials" => args.optuna_ntrials = parse_int(flag, value)?,
        "optuna_epoch_min" => args.optuna_epoch_min = parse_int(flag, value)?,
        "optuna_epoch_max" => args.optuna_epoch_max = parse_int(flag, value)?,
        "optuna_lr_min" => args.optuna_lr_min = parse_float(flag, value)?,
        "optuna_lr_max" => args.optuna_lr_max = parse_float(flag, value)?,
        "cpu" => args.cpu = truthy(flag, value),
        "tb" => args.tb = truthy(flag, value),
        "optuna" => args.optuna = truthy(flag, value),
        "label" => {
            args.label = value.parse::<Label>().map_err(|_| FlagError::InvalidValue {
                flag: flag.to_string(),
                expected: "one of mask, gender, age, total",
                token: value.to_string(),
            })?
        }
        "dataset" => args.dataset = value.to_string(),
        "augmentation" => args.augmentation = value.to_string(),
        "model" => args.model = value.to_string(),
        "optimizer" => args.optimizer = value.to_string(),
        "criterion" => args.criterion = value.to_string(),
        "name" => args.name = value.to_string(),
        "model_version" => args.model_version = value.to_string(),
        "load_params" => args.load_params = Some(value.to_string()),
        "data_dir" => args.data_dir = Some(value.to_string()),
        "model_dir" => args.model_dir = Some(value.to_string()),
        other => {
            return Err(FlagError::Unknown {
                flag: format!("--{other}"),
            });
        }
    }
    Ok(())
}

fn parse_int<T: std::str::FromStr>(flag: &str, token: &str) -> Result<T, FlagError> {
    token.parse::<T>().map_err(|_| FlagError::InvalidValue {
        flag: flag.to_string(),
        expected: "a non-negative integer",
        token: token.to_string(),
    })
}

fn parse_float(flag: &str, token: &str) -> Result<f64, FlagError> {
    token.parse::<f64>().map_err(|_| FlagError::InvalidValue {
        flag: flag.to_string(),
        expected: "a float",
        token: token.to_string(),
    })
}

fn parse_bool(flag: &str, token: &str) -> Result<bool, FlagError> {
    match token.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(FlagError::InvalidValue {
            flag: flag.to_string(),
            expected: "a boolean",
            token: token.to_string(),
        }),
    }
}

/// argparse `type=bool` semantics: `bool("False")` is `True` in Python, so
/// only an empty value turns the flag off.
fn truthy(flag: &str, token: &str) -> bool {
    if matches!(
        token.to_ascii_lowercase().as_str(),
        "false" | "0" | "no" | "off"
    ) {
        warn!(flag, token, "Trainer reads any non-empty value as True; pass '' to turn it off");
    }
    !token.is_empty()
}

fn truthy_token(value: bool) -> String {
    if value { "True".to_string() } else { String::new() }
}

/// Encode [`TrainArgs`] as canonical argv.
///
/// Required flags are always written, in driver-script order. Optional flags
/// appear only when they differ from the trainer default.
pub(super) fn encode(args: &TrainArgs) -> Vec<String> {
    let defaults = TrainArgs::default();
    let mut argv = Vec::with_capacity(48);
    let mut push = |flag: &str, values: &[String]| {
        argv.push(format!("--{flag}"));
        argv.extend_from_slice(values);
    };

    push("epochs", &[args.epochs.to_string()]);
    push("dataset", &[args.dataset.clone()]);
    push("label", &[args.label.to_string()]);
    push("augmentation", &[args.augmentation.clone()]);
    push(
        "resize",
        &[args.resize.height().to_string(), args.resize.width().to_string()],
    );
    push("lr", &[args.lr.to_string()]);
    push("lr_decay_step", &[args.lr_decay_step.to_string()]);
    push("lr_gamma", &[args.lr_gamma.to_string()]);
    push("batch_size", &[args.batch_size.to_string()]);
    push("valid_batch_size", &[args.valid_batch_size.to_string()]);
    push("model", &[args.model.clone()]);
    push("model_version", &[args.model_version.clone()]);
    push("optimizer", &[args.optimizer.clone()]);
    push("criterion", &[args.criterion.clone()]);
    push("log_interval", &[args.log_interval.to_string()]);
    push("name", &[args.name.clone()]);

    if args.seed != defaults.seed {
        push("seed", &[args.seed.to_string()]);
    }
    if args.val_ratio != defaults.val_ratio {
        push("val_ratio", &[args.val_ratio.to_string()]);
    }
    if args.beta != defaults.beta {
        push("beta", &[args.beta.to_string()]);
    }
    for (flag, value, default) in [
        ("cpu", args.cpu, defaults.cpu),
        ("tb", args.tb, defaults.tb),
        ("optuna", args.optuna, defaults.optuna),
    ] {
        if value != default {
            push(flag, &[truthy_token(value)]);
        }
    }
    for (flag, value, default) in [
        ("optuna_ntrials", args.optuna_ntrials, defaults.optuna_ntrials),
        ("optuna_epoch_min", args.optuna_epoch_min, defaults.optuna_epoch_min),
        ("optuna_epoch_max", args.optuna_epoch_max, defaults.optuna_epoch_max),
    ] {
        if value != default {
            push(flag, &[value.to_string()]);
        }
    }
    for (flag, value, default) in [
        ("optuna_lr_min", args.optuna_lr_min, defaults.optuna_lr_min),
        ("optuna_lr_max", args.optuna_lr_max, defaults.optuna_lr_max),
    ] {
        if value != default {
            push(flag, &[value.to_string()]);
        }
    }
    if let Some(list) = &args.optuna_optimizer {
        let values: Vec<String> = list.iter().map(f64::to_string).collect();
        push("optuna_optimizer", &values);
    }
    if let Some(path) = &args.load_params {
        push("load_params", &[path.clone()]);
    }
    if let Some(dir) = &args.data_dir {
        push("data_dir", &[dir.clone()]);
    }
    if let Some(dir) = &args.model_dir {
        push("model_dir", &[dir.clone()]);
    }

    if args.exist_ok {
        argv.push("--exist_ok".to_string());
    }
    argv
}
