//! Mixed-precision loss scaling
//!
//! Reduced-precision backward passes underflow on small gradients, so the
//! loss is multiplied by a scale factor before backward and gradients are
//! divided by it before the optimizer sees them. A dynamic scaler backs the
//! scale off whenever the unscaled gradients overflow and grows it again
//! after a run of clean steps.

mod config;
mod scaler;


pub use config::{MixedPrecisionConfig, Precision};
pub use scaler::GradScaler;
