//! Optimizers, gradient clipping and step-keyed schedules

mod adamw;
mod clip;
mod optimizer;
mod scheduler;
mod sgd;

pub use adamw::AdamW;
pub use clip::{clip_grad_norm, grad_norm};
pub use optimizer::Optimizer;
pub use scheduler::{gumbel_temperature, LrSchedule, TemperatureSchedule};
pub use sgd::SGD;
