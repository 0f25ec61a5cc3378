//! Validation error types

use crate::error::Error;

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Training manifest does not exist: {0}")]
    TrainManifestNotFound(String),

    #[error("Validation manifest does not exist: {0}")]
    ValidManifestNotFound(String),

    #[error("Invalid sample rate: {0} (must be > 0)")]
    InvalidSampleRate(u32),

    #[error("Invalid seconds per batch: {0} (must be > 0.0)")]
    InvalidBatchSeconds(f64),

    #[error("Invalid bucket count: {0} (must be > 0)")]
    InvalidBuckets(usize),

    #[error("Invalid validation batch size: {0} (must be > 0)")]
    InvalidValidBatchSize(usize),

    #[error("Invalid duration window: shorter than {min} but longer than {max}")]
    InvalidDurationWindow { min: f64, max: f64 },

    #[error("Invalid mask probability: {0} (must be in (0.0, 1.0])")]
    InvalidMaskProb(f32),

    #[error("Invalid mask length: {0} (must be > 0)")]
    InvalidMaskLength(usize),

    #[error("Invalid downsampling stack: {0}")]
    InvalidStack(String),

    #[error("Invalid model width: {0} (must be > 0)")]
    InvalidModelWidth(usize),

    #[error("Invalid number of negatives: {0} (must be > 0)")]
    InvalidNegatives(usize),

    #[error("Invalid diversity loss weight: {0} (must be finite and >= 0.0)")]
    InvalidDiversityWeight(f32),

    #[error("Invalid temperature: {0} (must be > 0.0)")]
    InvalidTemperature(f32),

    #[error("Invalid gumbel schedule: max {max}, min {min}, decay {decay}")]
    InvalidGumbelSchedule { max: f32, min: f32, decay: f32 },

    #[error("Invalid optimizer: {0} (must be one of: adamw, sgd)")]
    InvalidOptimizer(String),

    #[error("Invalid learning rate: {0} (must be > 0.0 and <= 1.0)")]
    InvalidLearningRate(f32),

    #[error("Invalid gradient clip value: {0} (must be > 0.0)")]
    InvalidGradClip(f32),

    #[error("Invalid epochs: {0} (must be > 0)")]
    InvalidEpochs(usize),

    #[error("Invalid accumulation factor: {0} (must be > 0)")]
    InvalidAccumulation(usize),

    #[error("Invalid log interval: {0} (must be > 0)")]
    InvalidLogInterval(u64),

    #[error("Invalid checkpoint keep count: {0} (must be > 0)")]
    InvalidKeep(usize),

    #[error("Invalid world size: {0} (must be > 0)")]
    InvalidWorldSize(usize),
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Config(err.to_string())
    }
}
