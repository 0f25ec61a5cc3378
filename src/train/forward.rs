//! Forward results and per-batch objectives

use ndarray::{Array3, ArrayView2, ArrayView3};

use super::stages::QuantizerStats;
use crate::error::{Error, Result, Stage};

/// Everything the objective needs from one forward pass
#[derive(Debug, Clone)]
pub struct ForwardResult {
    /// Projected embeddings at masked positions (B, m, C)
    pub embeddings: Array3<f32>,
    /// Targets at masked positions (B, m, C)
    pub targets: Array3<f32>,
    pub num_masked: usize,
    pub ratio_masked: f32,
    pub quantizer: Option<QuantizerStats>,
}

/// Scalar results of one micro-batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Objectives {
    /// Contrastive loss
    pub loss: f32,
    /// Loss that was back-propagated (contrastive plus weighted diversity)
    pub total_loss: f32,
    pub accuracy: f32,
    pub num_masked: usize,
    pub ratio_masked: f32,
    pub quantizer: Option<QuantizerStats>,
}

/// `base + diversity * weight * num_masked`, or exactly `base` at weight 0
pub fn composite_loss(
    base: f32,
    diversity_loss: Option<f32>,
    weight: f32,
    num_masked: usize,
) -> f32 {
    match diversity_loss {
        Some(div) if weight != 0.0 => base + div * weight * num_masked as f32,
        _ => base,
    }
}

/// Select masked time steps of `(B, T, C)` into `(B, m, C)`
///
/// Fails unless every mask row holds the same number of `true` entries.
pub fn gather_masked(
    values: ArrayView3<'_, f32>,
    mask: ArrayView2<'_, bool>,
) -> Result<Array3<f32>> {
    let (batch, time, channels) = values.dim();
    if mask.dim() != (batch, time) {
        return Err(Error::shape(
            Stage::Forward,
            format!("mask shape {:?} does not match values ({batch}, {time})", mask.dim()),
        ));
    }

    let positions: Vec<Vec<usize>> = mask
        .rows()
        .into_iter()
        .map(|row| row.iter().enumerate().filter(|(_, &m)| m).map(|(t, _)| t).collect())
        .collect();
    let per_row = positions.first().map_or(0, Vec::len);
    if let Some(bad) = positions.iter().position(|p| p.len() != per_row) {
        return Err(Error::shape(
            Stage::Forward,
            format!(
                "ragged mask: row {bad} has {} masked steps, row 0 has {per_row}",
                positions[bad].len()
            ),
        ));
    }

    Ok(Array3::from_shape_fn((batch, per_row, channels), |(b, j, c)| {
        values[[b, positions[b][j], c]]
    }))
}

/// Inverse of [`gather_masked`]: place `(B, m, C)` back on the `(B, T, C)` grid
pub fn scatter_masked(values: ArrayView3<'_, f32>, mask: ArrayView2<'_, bool>) -> Array3<f32> {
    let (batch, time) = mask.dim();
    let channels = values.dim().2;
    let mut out = Array3::<f32>::zeros((batch, time, channels));
    for (b, row) in mask.rows().into_iter().enumerate() {
        for (j, t) in row.iter().enumerate().filter(|(_, &m)| m).map(|(t, _)| t).enumerate() {
            for c in 0..channels {
                out[[b, t, c]] = values[[b, j, c]];
            }
        }
    }
    out
}
