//! Gradient clipping utilities

use crate::autograd::Tensor;

/// Global L2 norm over all gradients
///
/// Non-finite gradients produce a non-finite norm, which is how the engine
/// detects a step that must be skipped.
pub fn grad_norm(params: &[Tensor]) -> f32 {
    params.iter().map(Tensor::grad_norm_sq).sum::<f32>().sqrt()
}

/// Clip gradients by global norm
///
/// If the global norm exceeds `max_norm`, every gradient is scaled by
/// `max_norm / global_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(params: &mut [Tensor], max_norm: f32) -> f32 {
    let global_norm = grad_norm(params);

    if global_norm.is_finite() && global_norm > max_norm {
        let clip_coef = max_norm / global_norm;
        for param in params.iter_mut() {
            if let Some(grad) = param.grad_mut() {
                grad.mapv_inplace(|g| g * clip_coef);
            }
        }
    }

    global_norm
}
