//! Flat parameter tensor with an accumulating gradient buffer

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, Stage};

/// A named 1-D parameter buffer with an optional gradient
///
/// Gradients accumulate across backward calls until [`Tensor::zero_grad`]
/// is called, which is what gradient accumulation relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tensor {
    name: String,
    data: Array1<f32>,
    #[serde(skip)]
    grad: Option<Array1<f32>>,
    requires_grad: bool,
}

impl Tensor {
    /// Create a named trainable parameter
    pub fn new(name: impl Into<String>, data: Array1<f32>) -> Self {
        Self { name: name.into(), data, grad: None, requires_grad: true }
    }

    /// Create an unnamed tensor from a vector
    pub fn from_vec(data: Vec<f32>, requires_grad: bool) -> Self {
        Self { name: String::new(), data: Array1::from(data), grad: None, requires_grad }
    }

    /// Create a zero-filled tensor
    pub fn zeros(len: usize, requires_grad: bool) -> Self {
        Self { name: String::new(), data: Array1::zeros(len), grad: None, requires_grad }
    }

    /// Parameter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter values
    pub fn data(&self) -> &Array1<f32> {
        &self.data
    }

    /// Mutable parameter values
    pub fn data_mut(&mut self) -> &mut Array1<f32> {
        &mut self.data
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor has no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the optimizer should update this tensor
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Freeze or unfreeze the tensor
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// Current gradient, if any backward pass has written one
    pub fn grad(&self) -> Option<&Array1<f32>> {
        self.grad.as_ref()
    }

    /// Mutable gradient buffer
    pub fn grad_mut(&mut self) -> Option<&mut Array1<f32>> {
        self.grad.as_mut()
    }

    /// Replace the gradient
    pub fn set_grad(&mut self, grad: Array1<f32>) {
        self.grad = Some(grad);
    }

    /// Add `grad` into the gradient buffer, allocating it on first use
    pub fn accumulate_grad(&mut self, grad: ArrayView1<'_, f32>) -> Result<()> {
        if grad.len() != self.data.len() {
            return Err(Error::shape(
                Stage::Forward,
                format!(
                    "gradient for '{}' has {} elements, parameter has {}",
                    self.name,
                    grad.len(),
                    self.data.len()
                ),
            ));
        }
        match self.grad.as_mut() {
            Some(buf) => *buf += &grad,
            None => self.grad = Some(grad.to_owned()),
        }
        Ok(())
    }

    /// Reset the gradient buffer to zeros, keeping its allocation
    pub fn zero_grad(&mut self) {
        if let Some(grad) = self.grad.as_mut() {
            grad.fill(0.0);
        }
    }

    /// Squared L2 norm of the gradient (0 when absent)
    pub fn grad_norm_sq(&self) -> f32 {
        self.grad.as_ref().map_or(0.0, |g| g.iter().map(|&x| x * x).sum())
    }

    /// Whether every gradient element is finite
    pub fn grad_is_finite(&self) -> bool {
        self.grad.as_ref().is_none_or(|g| g.iter().all(|x| x.is_finite()))
    }
}
