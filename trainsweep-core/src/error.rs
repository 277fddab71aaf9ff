//! Error types for the trainsweep core library.
//!
//! Uses `thiserror` for public API error types. Flag-level errors carry the
//! offending flag and token so script checks can point at the exact mistake.

use std::path::PathBuf;

/// Top-level error type for the trainsweep core library.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Flag error: {0}")]
    Flag(#[from] FlagError),

    #[error("Script error in {path}:{line}: {message}")]
    Script {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Manifest error: {message}")]
    Manifest { message: String },

    #[error("Invalid run '{name}': {}", .problems.join("; "))]
    Validation { name: String, problems: Vec<String> },

    #[error("Launch error: {0}")]
    Launch(#[from] LaunchError),

    #[error("{path} is held by another trainsweep process")]
    Locked { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SweepError {
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }
}

/// Errors from decoding trainer command-line flags.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlagError {
    #[error("unknown flag '{flag}'")]
    Unknown { flag: String },

    #[error("flag '--{flag}' given more than once")]
    Duplicate { flag: String },

    #[error("flag '--{flag}' expects a value")]
    MissingValue { flag: String },

    #[error("flag '--{flag}' expects {expected}, got '{token}'")]
    InvalidValue {
        flag: String,
        expected: &'static str,
        token: String,
    },

    #[error("flag '--resize' expects exactly 2 integers, got {count}")]
    ResizeArity { count: usize },

    #[error("unexpected positional argument '{token}'")]
    Positional { token: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Errors from launching or supervising a trainer process.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for trainer process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Interpreter not found: {message}")]
    InterpreterNotFound { message: String },
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = SweepError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_error_display() {
        let err = FlagError::InvalidValue {
            flag: "lr".into(),
            expected: "a float",
            token: "fast".into(),
        };
        assert_eq!(err.to_string(), "flag '--lr' expects a float, got 'fast'");
    }

    #[test]
    fn test_validation_display_joins_problems() {
        let err = SweepError::Validation {
            name: "exp_mask".into(),
            problems: vec!["epochs must be >= 1".into(), "lr must be > 0".into()],
        };
        assert_eq!(
            err.to_string(),
            "Invalid run 'exp_mask': epochs must be >= 1; lr must be > 0"
        );
    }

    #[test]
    fn test_flag_error_converts() {
        let err: SweepError = FlagError::ResizeArity { count: 3 }.into();
        assert!(matches!(err, SweepError::Flag(FlagError::ResizeArity { count: 3 })));
    }
}
