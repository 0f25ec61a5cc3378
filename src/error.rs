//! Error types for the pretraining engine

use std::fmt;

/// Pipeline stage an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Mask generation and row equalization
    Masking,
    /// Negative sampling over masked targets
    NegativeSampling,
    /// Batch collation (padding, latent lengths)
    Collate,
    /// Forward pass through the model stages
    Forward,
    /// Gradient validation and optimizer update
    OptimizerStep,
    /// Gradient synchronization across replicas
    DistributedSync,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Masking => "masking",
            Stage::NegativeSampling => "negative sampling",
            Stage::Collate => "collate",
            Stage::Forward => "forward",
            Stage::OptimizerStep => "optimizer step",
            Stage::DistributedSync => "distributed sync",
        };
        f.write_str(name)
    }
}

/// Crate-level error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Data shape error during {stage}: {reason}")]
    DataShape { stage: Stage, reason: String },

    #[error("Numeric instability at step {step}: {reason}")]
    NumericInstability { step: u64, reason: String },

    #[error("Distributed desync: {0}")]
    DistributedDesync(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Tracking error: {0}")]
    Tracking(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Shorthand for a [`Error::DataShape`] error
    pub fn shape(stage: Stage, reason: impl Into<String>) -> Self {
        Error::DataShape { stage, reason: reason.into() }
    }

    /// Whether the error must terminate the whole job
    ///
    /// Only skipped-step instabilities below the patience limit are recovered
    /// inline, and those never surface as an `Error`.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::DataShape { .. } | Error::Audio(_))
    }
}

/// Result alias for pretraining operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error_names_stage() {
        let err = Error::shape(Stage::NegativeSampling, "T must be > 1, got 1");
        let msg = err.to_string();
        assert!(msg.contains("negative sampling"));
        assert!(msg.contains("T must be > 1"));
    }

    #[test]
    fn test_desync_is_fatal() {
        assert!(Error::DistributedDesync("step 3 vs 4".into()).is_fatal());
        assert!(Error::Config("bad".into()).is_fatal());
        assert!(!Error::shape(Stage::Masking, "m = 0").is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
