//! Negative sampling for the contrastive objective

use ndarray::{Array3, Array4, ArrayView3, ArrayView4};
use rand::Rng;

use crate::error::{Error, Result, Stage};

/// Sampled negative addresses for a `(B, T)` grid of targets
///
/// Each entry is a two-level address `(sequence, offset)`: negatives are only
/// drawn from the same sequence as their target, and never from the target's
/// own time step. Entries are laid out `[b][t][n]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegativeIndices {
    batch: usize,
    time: usize,
    num_negatives: usize,
    offsets: Vec<usize>,
}

impl NegativeIndices {
    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn time(&self) -> usize {
        self.time
    }

    pub fn num_negatives(&self) -> usize {
        self.num_negatives
    }

    /// Time offset within sequence `b` of negative `n` for target `(b, t)`
    pub fn offset(&self, b: usize, t: usize, n: usize) -> usize {
        self.offsets[(b * self.time + t) * self.num_negatives + n]
    }

    /// Row in the flattened `(B * T, C)` target view
    pub fn flat_index(&self, b: usize, t: usize, n: usize) -> usize {
        b * self.time + self.offset(b, t, n)
    }

    /// Negatives of target `(b, t)`, as offsets within its sequence
    pub fn negatives_of(&self, b: usize, t: usize) -> &[usize] {
        let start = (b * self.time + t) * self.num_negatives;
        &self.offsets[start..start + self.num_negatives]
    }
}

/// Draws distractors uniformly from the other time steps of each sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegativeSampler {
    num_negatives: usize,
}

impl NegativeSampler {
    pub fn new(num_negatives: usize) -> Result<Self> {
        if num_negatives == 0 {
            return Err(Error::Config("num_negatives must be >= 1".into()));
        }
        Ok(Self { num_negatives })
    }

    pub fn num_negatives(&self) -> usize {
        self.num_negatives
    }

    /// Sample addresses for a `(batch, time)` target grid
    ///
    /// Draws from `[0, T - 1)` and shifts draws at or past the target's own
    /// index up by one, giving a uniform choice over the `T - 1` other steps.
    pub fn sample_indices<R: Rng + ?Sized>(
        &self,
        batch: usize,
        time: usize,
        rng: &mut R,
    ) -> Result<NegativeIndices> {
        if time <= 1 {
            return Err(Error::shape(
                Stage::NegativeSampling,
                format!("need at least 2 masked steps per sequence to draw negatives, got {time}"),
            ));
        }
        let high = time - 1;
        let mut offsets = Vec::with_capacity(batch * time * self.num_negatives);
        for _ in 0..batch {
            for t in 0..time {
                for _ in 0..self.num_negatives {
                    let draw = rng.random_range(0..high);
                    offsets.push(if draw >= t { draw + 1 } else { draw });
                }
            }
        }
        Ok(NegativeIndices { batch, time, num_negatives: self.num_negatives, offsets })
    }

    /// Gather negatives for `targets` of shape `(B, T, C)` into `(N, B, T, C)`
    pub fn sample<R: Rng + ?Sized>(
        &self,
        targets: ArrayView3<'_, f32>,
        rng: &mut R,
    ) -> Result<(Array4<f32>, NegativeIndices)> {
        let (batch, time, channels) = targets.dim();
        let indices = self.sample_indices(batch, time, rng)?;
        let negatives = gather_negatives(targets, &indices);
        debug_assert_eq!(negatives.dim(), (self.num_negatives, batch, time, channels));
        Ok((negatives, indices))
    }
}

/// Materialize `(N, B, T, C)` negatives from sampled addresses
pub fn gather_negatives(targets: ArrayView3<'_, f32>, indices: &NegativeIndices) -> Array4<f32> {
    let (batch, time, channels) = targets.dim();
    Array4::from_shape_fn((indices.num_negatives, batch, time, channels), |(n, b, t, c)| {
        targets[[b, indices.offset(b, t, n), c]]
    })
}

/// Fold gradients w.r.t. gathered negatives back onto their target rows
pub fn scatter_negative_grads(
    grad_negatives: ArrayView4<'_, f32>,
    indices: &NegativeIndices,
) -> Array3<f32> {
    let (num_negatives, batch, time, channels) = grad_negatives.dim();
    let mut out = Array3::<f32>::zeros((batch, time, channels));
    for n in 0..num_negatives {
        for b in 0..batch {
            for t in 0..time {
                let src = indices.offset(b, t, n);
                for c in 0..channels {
                    out[[b, src, c]] += grad_negatives[[n, b, t, c]];
                }
            }
        }
    }
    out
}
