//! Contracts for the model stages and the contrastive objective
//!
//! The network itself is opaque to the engine. A model exposes four forward
//! stages with fixed tensor-shape contracts plus a `backward` that folds the
//! objective's gradients into its parameter buffers.

use ndarray::{Array3, Array4, ArrayView1, ArrayView2, ArrayView3, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::autograd::Tensor;
use crate::data::MaskedBatch;
use crate::error::Result;

/// Output of [`PretrainModel::latent_encoder`]
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Contextual embeddings over the full latent axis (B, T, C)
    pub embeddings: Array3<f32>,
    /// Total masked positions in the batch
    pub num_masked: usize,
    /// Fraction of valid latent positions that were masked
    pub ratio_masked: f32,
}

/// Codebook statistics reported by a quantizing target path
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizerStats {
    pub diversity_loss: f32,
    pub code_perplexity: f32,
    pub prob_perplexity: f32,
    pub num_vars: usize,
    pub temperature: f32,
}

/// Output of [`PretrainModel::target_quantizer`]
#[derive(Debug, Clone)]
pub struct QuantizerOutput {
    /// Targets at masked positions (B, m, C)
    pub targets: Array3<f32>,
    /// Present only when targets come from a quantizer
    pub stats: Option<QuantizerStats>,
}

/// Gradient signal handed to [`PretrainModel::backward`]
///
/// `grad_embeddings` and `grad_targets` already carry `scale`. Gradients of
/// the quantizer's diversity loss must be weighted by
/// `diversity_coeff * scale`.
#[derive(Debug, Clone)]
pub struct BackwardSignal {
    /// d(loss)/d(projected embeddings), shape (B, m, C)
    pub grad_embeddings: Array3<f32>,
    /// d(loss)/d(targets), negatives' gradients folded back onto their rows
    pub grad_targets: Option<Array3<f32>>,
    /// d(composite)/d(diversity_loss): `diversity_weight * num_masked`
    pub diversity_coeff: f32,
    /// Loss scale divided by the accumulation factor
    pub scale: f32,
}

/// A wav2vec2-style model split into its forward stages
pub trait PretrainModel: Send {
    /// Waveforms (B, T_wav) to latent frames (B, T, C_lat)
    fn latent_extractor(&self, wavs: ArrayView2<'_, f32>) -> Result<Array3<f32>>;

    /// Contextualize latents with masked positions replaced
    fn latent_encoder(
        &self,
        latents: ArrayView3<'_, f32>,
        mask: ArrayView2<'_, bool>,
        wav_lens: ArrayView1<'_, f32>,
    ) -> Result<EncoderOutput>;

    /// Project masked embeddings (B, m, C) into the target space
    fn feature_projection(&self, embeddings: ArrayView3<'_, f32>) -> Result<Array3<f32>>;

    /// Targets for masked latents (B, m, C_lat)
    fn target_quantizer(&self, masked_latents: ArrayView3<'_, f32>) -> Result<QuantizerOutput>;

    /// Whether a quantizer with an annealed temperature is present
    fn has_quantizer(&self) -> bool {
        false
    }

    /// Set the Gumbel-softmax temperature of the quantizer
    fn set_quantizer_temperature(&mut self, _temperature: f32) {}

    fn parameters(&self) -> &[Tensor];

    fn parameters_mut(&mut self) -> &mut [Tensor];

    /// Accumulate parameter gradients for `batch` into the parameter buffers
    fn backward(&mut self, batch: &MaskedBatch, signal: &BackwardSignal) -> Result<()>;
}

/// Output of a [`ContrastiveObjective`]
#[derive(Debug, Clone)]
pub struct ObjectiveOutput {
    pub loss: f32,
    /// Fraction of positions whose positive outranks every negative
    pub accuracy: f32,
    /// d(loss)/d(embeddings), shape (B, m, C)
    pub grad_embeddings: Array3<f32>,
    /// d(loss)/d(targets), when the objective propagates into targets
    pub grad_targets: Option<Array3<f32>>,
    /// d(loss)/d(negatives), shape (N, B, m, C)
    pub grad_negatives: Option<Array4<f32>>,
}

/// `loss(embeddings, targets, negatives) -> (loss, accuracy)` plus gradients
pub trait ContrastiveObjective: Send + Sync {
    /// `embeddings` and `targets` are (B, m, C); `negatives` is (N, B, m, C)
    fn evaluate(
        &self,
        embeddings: ArrayView3<'_, f32>,
        targets: ArrayView3<'_, f32>,
        negatives: ArrayView4<'_, f32>,
    ) -> Result<ObjectiveOutput>;
}
