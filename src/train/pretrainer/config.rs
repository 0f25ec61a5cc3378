//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::autograd::MixedPrecisionConfig;
use crate::error::{Error, Result};
use crate::optim::{LrSchedule, TemperatureSchedule};

/// Settings of the training-step engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainConfig {
    /// Micro-batches per optimizer step
    pub accumulation_factor: usize,
    /// Weight of the quantizer diversity loss (0 disables it)
    pub diversity_loss_weight: f32,
    /// Negatives drawn per masked position
    pub num_negatives: usize,
    /// Global gradient norm clip
    pub max_grad_norm: Option<f32>,
    /// Optimizer steps between log records
    pub log_interval: u64,
    /// Consecutive non-finite steps tolerated before aborting
    pub nonfinite_patience: u32,
    /// Checkpoints retained after each validation
    pub keep_checkpoints: usize,
    pub precision: MixedPrecisionConfig,
    pub lr_schedule: LrSchedule,
    pub temperature: TemperatureSchedule,
    /// Seed for negative sampling
    pub seed: u64,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self {
            accumulation_factor: 1,
            diversity_loss_weight: 0.1,
            num_negatives: 100,
            max_grad_norm: None,
            log_interval: 100,
            nonfinite_patience: 10,
            keep_checkpoints: 2,
            precision: MixedPrecisionConfig::fp32(),
            lr_schedule: LrSchedule::default(),
            temperature: TemperatureSchedule::default(),
            seed: 1986,
        }
    }
}

impl PretrainConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accumulation_factor(mut self, factor: usize) -> Self {
        self.accumulation_factor = factor;
        self
    }

    pub fn with_diversity_loss_weight(mut self, weight: f32) -> Self {
        self.diversity_loss_weight = weight;
        self
    }

    pub fn with_num_negatives(mut self, n: usize) -> Self {
        self.num_negatives = n;
        self
    }

    pub fn with_grad_clip(mut self, max_norm: f32) -> Self {
        self.max_grad_norm = Some(max_norm);
        self
    }

    pub fn with_log_interval(mut self, interval: u64) -> Self {
        self.log_interval = interval;
        self
    }

    pub fn with_nonfinite_patience(mut self, patience: u32) -> Self {
        self.nonfinite_patience = patience;
        self
    }

    pub fn with_keep_checkpoints(mut self, keep: usize) -> Self {
        self.keep_checkpoints = keep;
        self
    }

    /// Enable fp16 mixed precision with dynamic loss scaling
    pub fn with_fp16(mut self) -> Self {
        self.precision = MixedPrecisionConfig::fp16();
        self
    }

    pub fn with_precision(mut self, precision: MixedPrecisionConfig) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_lr_schedule(mut self, schedule: LrSchedule) -> Self {
        self.lr_schedule = schedule;
        self
    }

    pub fn with_temperature(mut self, schedule: TemperatureSchedule) -> Self {
        self.temperature = schedule;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.accumulation_factor == 0 {
            return Err(Error::Config("accumulation_factor must be >= 1".into()));
        }
        if self.num_negatives == 0 {
            return Err(Error::Config("num_negatives must be >= 1".into()));
        }
        if !self.diversity_loss_weight.is_finite() || self.diversity_loss_weight < 0.0 {
            return Err(Error::Config(format!(
                "diversity_loss_weight must be finite and >= 0, got {}",
                self.diversity_loss_weight
            )));
        }
        if let Some(norm) = self.max_grad_norm {
            if !(norm > 0.0) {
                return Err(Error::Config(format!("max_grad_norm must be > 0, got {norm}")));
            }
        }
        if self.log_interval == 0 {
            return Err(Error::Config("log_interval must be >= 1".into()));
        }
        if self.keep_checkpoints == 0 {
            return Err(Error::Config("keep_checkpoints must be >= 1".into()));
        }
        if !(self.precision.initial_scale > 0.0) {
            return Err(Error::Config("initial loss scale must be > 0".into()));
        }
        Ok(())
    }
}
