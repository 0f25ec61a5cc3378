//! Span masking over the latent time axis

use ndarray::Array2;
use rand::seq::index;
use rand::Rng;

use crate::error::{Error, Result, Stage};

/// Draws contiguous masked spans per sequence, then equalizes row counts
///
/// Downstream, embeddings and targets are gathered at masked positions and
/// reshaped to `(B, m, C)`; that reshape only works if every row of the mask
/// holds the same number of `true` entries.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskGenerator {
    mask_prob: f32,
    mask_length: usize,
}

impl MaskGenerator {
    /// Create a generator; `mask_prob` in (0, 1], `mask_length` >= 1
    pub fn new(mask_prob: f32, mask_length: usize) -> Result<Self> {
        if !(mask_prob > 0.0 && mask_prob <= 1.0) {
            return Err(Error::Config(format!("mask_prob must be in (0, 1], got {mask_prob}")));
        }
        if mask_length == 0 {
            return Err(Error::Config("mask_length must be >= 1".into()));
        }
        Ok(Self { mask_prob, mask_length })
    }

    /// Target masking probability
    pub fn mask_prob(&self) -> f32 {
        self.mask_prob
    }

    /// Span length in latent steps
    pub fn mask_length(&self) -> usize {
        self.mask_length
    }

    /// Raw span mask of shape `(B, max(lengths))`, before equalization
    ///
    /// Each row gets `floor(p * L / l + u)` spans with `u ~ U[0, 1)`, so the
    /// expected masked fraction is about `p` before span overlap. Span starts
    /// are distinct and drawn from `[0, L - l]`; positions at or beyond `L`
    /// stay `false`.
    pub fn sample_spans<R: Rng + ?Sized>(&self, lengths: &[usize], rng: &mut R) -> Array2<bool> {
        let width = lengths.iter().copied().max().unwrap_or(0);
        let mut mask = Array2::from_elem((lengths.len(), width), false);

        for (i, &len) in lengths.iter().enumerate() {
            if len == 0 {
                continue;
            }
            let expected = self.mask_prob as f64 * len as f64 / self.mask_length as f64;
            let num_spans = (expected + rng.random::<f64>()).floor() as usize;
            let num_starts = len.saturating_sub(self.mask_length) + 1;
            let num_spans = num_spans.min(num_starts);

            let mut row = mask.row_mut(i);
            for start in index::sample(&mut *rng, num_starts, num_spans) {
                let end = (start + self.mask_length).min(len);
                for t in start..end {
                    row[t] = true;
                }
            }
        }

        mask
    }

    /// Equalized mask for a batch with the given latent lengths
    ///
    /// Fails with a masking [`Error::DataShape`] if the batch is empty or the
    /// common masked count is zero.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        lengths: &[usize],
        rng: &mut R,
    ) -> Result<Array2<bool>> {
        if lengths.is_empty() {
            return Err(Error::shape(Stage::Masking, "cannot mask an empty batch"));
        }
        let mut mask = self.sample_spans(lengths, rng);
        let common = equalize_mask_rows(&mut mask, rng);
        if common == 0 {
            return Err(Error::shape(
                Stage::Masking,
                format!(
                    "no common masked positions for latent lengths {lengths:?} \
                     (mask_prob={}, mask_length={}); filter shorter samples upstream",
                    self.mask_prob, self.mask_length
                ),
            ));
        }
        Ok(mask)
    }
}

impl Default for MaskGenerator {
    fn default() -> Self {
        Self { mask_prob: 0.65, mask_length: 10 }
    }
}

/// Clear random masked positions until every row has the minimum row count
///
/// For each row holding more than `m = min_row_count` trues, `count - m` of
/// its true positions are chosen uniformly without replacement and set to
/// false. Returns `m`.
pub fn equalize_mask_rows<R: Rng + ?Sized>(mask: &mut Array2<bool>, rng: &mut R) -> usize {
    let counts: Vec<usize> =
        mask.rows().into_iter().map(|row| row.iter().filter(|&&v| v).count()).collect();
    let Some(&min_true) = counts.iter().min() else {
        return 0;
    };

    for (i, &count) in counts.iter().enumerate() {
        if count <= min_true {
            continue;
        }
        let mut row = mask.row_mut(i);
        let true_idx: Vec<usize> =
            row.iter().enumerate().filter_map(|(t, &v)| v.then_some(t)).collect();
        for k in index::sample(&mut *rng, true_idx.len(), count - min_true) {
            row[true_idx[k]] = false;
        }
    }

    min_true
}
