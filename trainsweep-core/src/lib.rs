//! # trainsweep-core
//!
//! Launcher library for an external image-classification trainer. It reads
//! the ways runs are described (shell driver scripts, TOML manifests, plain
//! flags), validates every invocation, plans output directories, and runs
//! the trainer one process at a time while recording what happened.

// Foundation
pub mod config;
pub mod error;
pub mod persistence;
pub mod runtime;

// Describing runs
pub mod invocation;
pub mod manifest;

// Planning and execution
pub mod training;

// Re-exports
pub use config::{SweepConfig, load_config};
pub use error::{ConfigError, FlagError, LaunchError, SweepError};
pub use invocation::{Invocation, Label, Resize, TrainArgs};
pub use manifest::Manifest;
pub use runtime::TrainerRuntime;
