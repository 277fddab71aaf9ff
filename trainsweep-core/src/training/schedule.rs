//! Step learning-rate schedule preview.
//!
//! The trainer decays its learning rate by `lr_gamma` every `lr_decay_step`
//! epochs. Showing the resulting milestones in a plan catches schedules that
//! never decay (step > epochs) or decay to nothing.

use crate::invocation::TrainArgs;
use serde::Serialize;

/// A step decay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepLr {
    pub base_lr: f64,
    pub step: u32,
    pub gamma: f64,
}

/// Epoch at which the learning rate changes, with the new rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Milestone {
    pub epoch: u32,
    pub lr: f64,
}

impl StepLr {
    pub fn new(base_lr: f64, step: u32, gamma: f64) -> Self {
        Self {
            base_lr,
            step,
            gamma,
        }
    }

    pub fn from_args(args: &TrainArgs) -> Self {
        Self::new(args.lr, args.lr_decay_step, args.lr_gamma)
    }

    /// Learning rate in effect during `epoch` (0-based).
    pub fn lr_at(&self, epoch: u32) -> f64 {
        if self.step == 0 {
            return self.base_lr;
        }
        let decays = (epoch / self.step) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    /// Rate changes within the first `epochs` epochs.
    pub fn milestones(&self, epochs: u32) -> Vec<Milestone> {
        if self.step == 0 {
            return Vec::new();
        }
        (1..)
            .map(|k| k * self.step)
            .take_while(|epoch| *epoch < epochs)
            .map(|epoch| Milestone {
                epoch,
                lr: self.lr_at(epoch),
            })
            .collect()
    }

    /// Rate during the last epoch of an `epochs`-long run.
    pub fn final_lr(&self, epochs: u32) -> f64 {
        self.lr_at(epochs.saturating_sub(1))
    }
}
