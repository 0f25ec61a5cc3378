//! Optimizer trait

use crate::autograd::Tensor;
use crate::error::Result;

/// Trait for optimization algorithms
pub trait Optimizer: Send {
    /// Apply one update from the current gradients
    fn step(&mut self, params: &mut [Tensor]);

    /// Zero out all gradients
    fn zero_grad(&mut self, params: &mut [Tensor]) {
        for param in params {
            param.zero_grad();
        }
    }

    /// Get learning rate
    fn lr(&self) -> f32;

    /// Set learning rate
    fn set_lr(&mut self, lr: f32);

    /// Serializable optimizer state for checkpoints
    fn state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Restore state produced by [`Optimizer::state`]
    fn load_state(&mut self, _state: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}
