//! Training metrics recovered from trainer output.
//!
//! The trainer prints one progress line every `log_interval` batches and one
//! validation summary per epoch:
//!
//! ```text
//! Epoch[3/30](40/118) || training loss 0.4521 || training accuracy 84.38% || training f1 71.20% || lr 0.0001
//! [Val] f1 : 68.41%, loss: 0.52 || best f1 : 70.02%, best loss: 0.49
//! ```
//!
//! Percentages are stored as fractions.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

const NUM: &str = r"([-+]?(?:\d+\.?\d*(?:[eE][-+]?\d+)?|\.\d+(?:[eE][-+]?\d+)?|nan|inf))";

static TRAIN_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"Epoch\[(\d+)/(\d+)\]\((\d+)/(\d+)\)\s*\|\|\s*training loss\s+{NUM}\s*\|\|\s*training accuracy\s+{NUM}%\s*\|\|\s*training f1\s+{NUM}%\s*\|\|\s*lr\s+{NUM}"
    ))
    .expect("train line pattern is valid")
});

static VAL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"\[Val\]\s*f1\s*:\s*{NUM}%,\s*loss:\s*{NUM}\s*\|\|\s*best f1\s*:\s*{NUM}%,\s*best loss:\s*{NUM}"
    ))
    .expect("validation line pattern is valid")
});

/// A training progress report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainProgress {
    pub epoch: usize,
    pub epochs: usize,
    pub step: usize,
    pub steps: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub f1: f64,
    pub lr: f64,
}

/// A per-epoch validation summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub f1: f64,
    pub loss: f64,
    pub best_f1: f64,
    pub best_loss: f64,
}

/// Something the trainer reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrainerEvent {
    Train(TrainProgress),
    Validation(ValidationSummary),
}

fn number(s: &str) -> f64 {
    s.parse().unwrap_or(f64::NAN)
}

/// Recognise a trainer progress or validation line.
pub fn parse_line(line: &str) -> Option<TrainerEvent> {
    if let Some(c) = TRAIN_LINE.captures(line) {
        let int = |i: usize| c[i].parse::<usize>().unwrap_or(0);
        return Some(TrainerEvent::Train(TrainProgress {
            epoch: int(1),
            epochs: int(2),
            step: int(3),
            steps: int(4),
            loss: number(&c[5]),
            accuracy: number(&c[6]) / 100.0,
            f1: number(&c[7]) / 100.0,
            lr: number(&c[8]),
        }));
    }
    if let Some(c) = VAL_LINE.captures(line) {
        return Some(TrainerEvent::Validation(ValidationSummary {
            f1: number(&c[1]) / 100.0,
            loss: number(&c[2]),
            best_f1: number(&c[3]) / 100.0,
            best_loss: number(&c[4]),
        }));
    }
    None
}

/// Metrics for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub epochs_completed: usize,
    pub total_epochs: Option<usize>,
    /// Training loss of the last logged interval in each epoch.
    pub loss_history: Vec<f64>,
    pub accuracy_history: Vec<f64>,
    pub f1_history: Vec<f64>,
    pub val_loss_history: Vec<f64>,
    pub val_f1_history: Vec<f64>,
    /// Epoch index (as printed by the trainer) with the best validation F1.
    pub best_epoch: Option<usize>,
    pub best_val_f1: Option<f64>,
    pub best_val_loss: Option<f64>,
    pub last_lr: Option<f64>,
    #[serde(skip)]
    pending: Option<TrainProgress>,
}

impl RunMetrics {
    /// Feed one output line; returns the event if the line was recognised.
    pub fn observe_line(&mut self, line: &str) -> Option<TrainerEvent> {
        let event = parse_line(line)?;
        self.record(event);
        Some(event)
    }

    pub fn record(&mut self, event: TrainerEvent) {
        match event {
            TrainerEvent::Train(progress) => {
                self.total_epochs = Some(progress.epochs);
                self.last_lr = Some(progress.lr);
                self.pending = Some(progress);
            }
            TrainerEvent::Validation(summary) => self.record_epoch(summary),
        }
    }

    fn record_epoch(&mut self, summary: ValidationSummary) {
        let epoch = match self.pending.take() {
            Some(progress) => {
                self.loss_history.push(progress.loss);
                self.accuracy_history.push(progress.accuracy);
                self.f1_history.push(progress.f1);
                progress.epoch
            }
            None => self.epochs_completed,
        };
        self.val_loss_history.push(summary.loss);
        self.val_f1_history.push(summary.f1);
        self.epochs_completed += 1;

        // A NaN best never blocks a later real value.
        let improves = |best: Option<f64>, better: bool| match best {
            Some(b) if b.is_finite() => better,
            _ => true,
        };
        if improves(self.best_val_f1, self.best_val_f1.is_some_and(|b| summary.f1 > b)) {
            self.best_val_f1 = Some(summary.f1);
            self.best_epoch = Some(epoch);
        }
        if improves(self.best_val_loss, self.best_val_loss.is_some_and(|b| summary.loss < b)) {
            self.best_val_loss = Some(summary.loss);
        }
    }

    /// The search objective: best validation F1 seen.
    pub fn objective(&self) -> Option<f64> {
        self.best_val_f1.filter(|f1| f1.is_finite())
    }
}
