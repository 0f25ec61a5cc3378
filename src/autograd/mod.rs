//! Parameter tensors and mixed-precision support
//!
//! The model stages are opaque to the engine: they own their computation and
//! write gradients into [`Tensor`] buffers during backward. The engine only
//! sees flat parameter buffers, which is all it needs for accumulation,
//! synchronization, clipping and optimizer updates.

pub mod precision;
mod tensor;

pub use precision::{GradScaler, MixedPrecisionConfig, Precision};
pub use tensor::Tensor;
