//! Gradient scaler for mixed-precision training

use super::MixedPrecisionConfig;
use crate::autograd::Tensor;

/// Lower bound the dynamic scale never backs off below
const MIN_SCALE: f32 = 1.0;

/// Loss scaler with overflow-driven backoff
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    steps_since_growth: usize,
    dynamic: bool,
    overflow_count: usize,
    successful_steps: usize,
}

impl GradScaler {
    /// Create a dynamic scaler with default growth/backoff factors
    pub fn new(initial_scale: f32) -> Self {
        Self::from_config(&MixedPrecisionConfig::fp16().with_initial_scale(initial_scale))
    }

    /// Create from config
    pub fn from_config(config: &MixedPrecisionConfig) -> Self {
        Self {
            scale: config.initial_scale,
            growth_factor: config.scale_growth_factor,
            backoff_factor: config.scale_backoff_factor,
            growth_interval: config.scale_growth_interval.max(1),
            steps_since_growth: 0,
            dynamic: config.dynamic_scaling,
            overflow_count: 0,
            successful_steps: 0,
        }
    }

    /// A scaler that never scales (scale 1, static)
    pub fn disabled() -> Self {
        Self::from_config(&MixedPrecisionConfig::fp32())
    }

    /// Current scale
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Overwrite the current scale, e.g. when resuming from a checkpoint
    pub fn set_scale(&mut self, scale: f32) {
        self.scale = scale.max(MIN_SCALE);
        self.steps_since_growth = 0;
    }

    /// Scale a loss value
    pub fn scale_loss(&self, loss: f32) -> f32 {
        loss * self.scale
    }

    /// Divide every gradient by the current scale
    ///
    /// Returns true if all unscaled gradients are finite.
    pub fn unscale_grads(&self, params: &mut [Tensor]) -> bool {
        let inv_scale = 1.0 / self.scale;
        let mut finite = true;
        for param in params.iter_mut() {
            if let Some(grad) = param.grad_mut() {
                grad.mapv_inplace(|g| g * inv_scale);
                finite &= grad.iter().all(|g| g.is_finite());
            }
        }
        finite
    }

    /// Update the scale after a boundary; pass whether gradients were valid
    pub fn update(&mut self, grads_valid: bool) {
        if grads_valid {
            self.successful_steps += 1;
        } else {
            self.overflow_count += 1;
        }
        if !self.dynamic {
            return;
        }

        if grads_valid {
            self.steps_since_growth += 1;
            if self.steps_since_growth >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.steps_since_growth = 0;
            }
        } else {
            self.scale = (self.scale * self.backoff_factor).max(MIN_SCALE);
            self.steps_since_growth = 0;
        }
    }

    /// Number of overflowing boundaries seen
    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }

    /// Number of clean boundaries seen
    pub fn successful_steps(&self) -> usize {
        self.successful_steps
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(65536.0)
    }
}
