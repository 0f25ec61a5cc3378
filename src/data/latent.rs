//! Convolution arithmetic for the latent time axis

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// (kernel, stride) pairs of the feature extractor's convolution stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownsamplingStack {
    pub kernels: Vec<usize>,
    pub strides: Vec<usize>,
}

impl DownsamplingStack {
    /// Build a stack, checking that kernels and strides pair up
    pub fn new(kernels: Vec<usize>, strides: Vec<usize>) -> Result<Self> {
        let stack = Self { kernels, strides };
        stack.validate()?;
        Ok(stack)
    }

    /// Check the stack is non-empty with matching, positive entries
    pub fn validate(&self) -> Result<()> {
        if self.kernels.is_empty() {
            return Err(Error::Config("downsampling stack is empty".into()));
        }
        if self.kernels.len() != self.strides.len() {
            return Err(Error::Config(format!(
                "downsampling stack has {} kernels but {} strides",
                self.kernels.len(),
                self.strides.len()
            )));
        }
        if self.kernels.iter().chain(&self.strides).any(|&v| v == 0) {
            return Err(Error::Config("kernel and stride sizes must be > 0".into()));
        }
        Ok(())
    }

    /// Iterate over (kernel, stride) pairs
    pub fn layers(&self) -> impl DoubleEndedIterator<Item = (usize, usize)> + '_ {
        self.kernels.iter().copied().zip(self.strides.iter().copied())
    }

    /// Product of all strides (waveform samples per latent step)
    pub fn total_stride(&self) -> usize {
        self.strides.iter().product()
    }
}

impl Default for DownsamplingStack {
    /// The wav2vec2 base feature extractor (20ms frames at 16 kHz)
    fn default() -> Self {
        Self { kernels: vec![10, 3, 3, 3, 3, 2, 2], strides: vec![5, 2, 2, 2, 2, 2, 2] }
    }
}

/// Number of latent steps produced from `input_len` waveform samples
///
/// Applies `floor((len - kernel) / stride + 1)` per layer. Inputs shorter
/// than a layer's kernel produce zero steps.
pub fn latent_length(stack: &DownsamplingStack, input_len: usize) -> usize {
    let mut len = input_len as i64;
    for (kernel, stride) in stack.layers() {
        if len < kernel as i64 {
            return 0;
        }
        len = (len - kernel as i64).div_euclid(stride as i64) + 1;
    }
    len as usize
}

/// [`latent_length`] for every input
pub fn latent_lengths(stack: &DownsamplingStack, input_lens: &[usize]) -> Vec<usize> {
    input_lens.iter().map(|&len| latent_length(stack, len)).collect()
}

/// Smallest waveform length that produces `latent_len` latent steps
///
/// Every input in `[min_input_length(n), min_input_length(n + 1))` maps to
/// exactly `n` steps; the extra samples fall beyond what the stack reads.
pub fn min_input_length(stack: &DownsamplingStack, latent_len: usize) -> usize {
    if latent_len == 0 {
        return 0;
    }
    stack.layers().rev().fold(latent_len, |len, (kernel, stride)| (len - 1) * stride + kernel)
}
