//! Configuration for mixed-precision training

use serde::{Deserialize, Serialize};

/// Numeric format the model stages run their backward pass in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn is_reduced(self) -> bool {
        self != Precision::Fp32
    }
}

/// Loss-scaling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixedPrecisionConfig {
    /// Precision the model stages compute in
    pub compute_precision: Precision,
    /// Initial loss scale factor
    pub initial_scale: f32,
    /// Factor to increase scale by after `scale_growth_interval` clean steps
    pub scale_growth_factor: f32,
    /// Factor to decrease scale by on overflow
    pub scale_backoff_factor: f32,
    /// Number of clean steps before increasing scale
    pub scale_growth_interval: usize,
    /// Whether to adapt the scale at all
    pub dynamic_scaling: bool,
}

impl MixedPrecisionConfig {
    /// Full precision, scale fixed at 1
    pub fn fp32() -> Self {
        Self {
            compute_precision: Precision::Fp32,
            initial_scale: 1.0,
            scale_growth_factor: 2.0,
            scale_backoff_factor: 0.5,
            scale_growth_interval: 2000,
            dynamic_scaling: false,
        }
    }

    /// fp16 with dynamic scaling starting at 2^16
    pub fn fp16() -> Self {
        Self {
            compute_precision: Precision::Fp16,
            initial_scale: 65536.0,
            scale_growth_factor: 2.0,
            scale_backoff_factor: 0.5,
            scale_growth_interval: 2000,
            dynamic_scaling: true,
        }
    }

    /// bf16; the wide exponent range makes scaling unnecessary
    pub fn bf16() -> Self {
        Self {
            compute_precision: Precision::Bf16,
            initial_scale: 1.0,
            scale_growth_factor: 2.0,
            scale_backoff_factor: 0.5,
            scale_growth_interval: 2000,
            dynamic_scaling: false,
        }
    }

    /// Config for the boolean `mixed_precision` option
    pub fn from_flag(enabled: bool) -> Self {
        if enabled {
            Self::fp16()
        } else {
            Self::fp32()
        }
    }

    /// Whether mixed precision is enabled
    pub fn is_mixed(&self) -> bool {
        self.compute_precision.is_reduced()
    }

    /// Set initial loss scale
    pub fn with_initial_scale(mut self, scale: f32) -> Self {
        self.initial_scale = scale;
        self
    }

    /// Set the number of clean steps between scale increases
    pub fn with_growth_interval(mut self, steps: usize) -> Self {
        self.scale_growth_interval = steps.max(1);
        self
    }

    /// Enable/disable dynamic scaling
    pub fn with_dynamic_scaling(mut self, enabled: bool) -> Self {
        self.dynamic_scaling = enabled;
        self
    }
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self::fp32()
    }
}
