//! Learning-rate and quantizer-temperature schedules
//!
//! Both are pure functions of the optimizer step so that a resumed run
//! picks up exactly where it stopped without any hidden scheduler state.

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Learning-rate schedule keyed by optimizer step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    /// Fixed learning rate
    Constant { lr: f32 },
    /// lr * min(1, step / warmup_steps)
    LinearWarmup { lr: f32, warmup_steps: u64 },
    /// Linear warmup to `lr_max`, then cosine decay to `lr_min` at `total_steps`
    WarmupCosine { lr_max: f32, lr_min: f32, warmup_steps: u64, total_steps: u64 },
    /// Linear warmup, then `lr * decay_factor^((step - warmup) / decay_steps)`
    WarmupExpDecay { lr: f32, warmup_steps: u64, decay_steps: u64, decay_factor: f32 },
}

impl LrSchedule {
    /// Learning rate to use after `step` optimizer updates
    pub fn lr_at(&self, step: u64) -> f32 {
        match *self {
            LrSchedule::Constant { lr } => lr,
            LrSchedule::LinearWarmup { lr, warmup_steps } => {
                lr * warmup_progress(step, warmup_steps)
            }
            LrSchedule::WarmupCosine { lr_max, lr_min, warmup_steps, total_steps } => {
                if step < warmup_steps {
                    return lr_max * warmup_progress(step, warmup_steps);
                }
                let decay_steps = total_steps.saturating_sub(warmup_steps);
                let decay_step = step - warmup_steps;
                if decay_steps == 0 || decay_step >= decay_steps {
                    return lr_min;
                }
                let progress = decay_step as f32 / decay_steps as f32;
                lr_min + (lr_max - lr_min) * 0.5 * (1.0 + (PI * progress).cos())
            }
            LrSchedule::WarmupExpDecay { lr, warmup_steps, decay_steps, decay_factor } => {
                if step < warmup_steps {
                    return lr * warmup_progress(step, warmup_steps);
                }
                let exponent = (step - warmup_steps) as f32 / decay_steps.max(1) as f32;
                (lr * decay_factor.powf(exponent)).min(lr)
            }
        }
    }

    /// Peak learning rate, used to initialize the optimizer
    pub fn peak_lr(&self) -> f32 {
        match *self {
            LrSchedule::Constant { lr }
            | LrSchedule::LinearWarmup { lr, .. }
            | LrSchedule::WarmupExpDecay { lr, .. } => lr,
            LrSchedule::WarmupCosine { lr_max, .. } => lr_max,
        }
    }
}

fn warmup_progress(step: u64, warmup_steps: u64) -> f32 {
    if warmup_steps == 0 {
        1.0
    } else {
        (step as f32 / warmup_steps as f32).min(1.0)
    }
}

impl Default for LrSchedule {
    fn default() -> Self {
        LrSchedule::WarmupExpDecay {
            lr: 5e-4,
            warmup_steps: 10_000,
            decay_steps: 390_000,
            decay_factor: 0.1,
        }
    }
}

/// Gumbel-softmax temperature annealing for the target quantizer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSchedule {
    pub max: f32,
    pub min: f32,
    pub decay: f32,
}

impl Default for TemperatureSchedule {
    fn default() -> Self {
        Self { max: 2.0, min: 0.5, decay: 0.999_995 }
    }
}

/// `max(max_temp * decay^step, min_temp)`
pub fn gumbel_temperature(schedule: &TemperatureSchedule, step: u64) -> f32 {
    let decayed = f64::from(schedule.max) * f64::from(schedule.decay).powf(step as f64);
    (decayed as f32).max(schedule.min)
}
