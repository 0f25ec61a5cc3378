//! Batch collation: padding, latent lengths and masking

use ndarray::{s, Array1, Array2};
use rand::Rng;

use super::latent::{latent_lengths, DownsamplingStack};
use super::mask::MaskGenerator;
use super::source::Sample;
use crate::error::{Error, Result, Stage};

/// Padded, masked minibatch ready for the forward pass
#[derive(Debug, Clone)]
pub struct MaskedBatch {
    pub ids: Vec<String>,
    /// Right-padded waveforms (B, T_wav)
    pub wavs: Array2<f32>,
    /// Valid waveform length per row
    pub wav_lens: Vec<usize>,
    /// Valid latent length per row
    pub latent_lens: Vec<usize>,
    /// Latent-aligned mask (B, T_latent), equal true-count per row
    pub mask: Array2<bool>,
}

impl MaskedBatch {
    pub fn batch_size(&self) -> usize {
        self.wavs.nrows()
    }

    /// Latent time axis length
    pub fn latent_len(&self) -> usize {
        self.mask.ncols()
    }

    /// Masked positions per row
    pub fn num_masked_per_row(&self) -> usize {
        self.mask.row(0).iter().filter(|&&m| m).count()
    }

    /// Valid lengths as fractions of the padded length
    pub fn relative_lens(&self) -> Array1<f32> {
        let max = self.wavs.ncols().max(1) as f32;
        self.wav_lens.iter().map(|&l| l as f32 / max).collect()
    }
}

/// Turns loaded samples into a [`MaskedBatch`]
#[derive(Debug, Clone, Default)]
pub struct Collator {
    stack: DownsamplingStack,
    masker: MaskGenerator,
}

impl Collator {
    pub fn new(stack: DownsamplingStack, masker: MaskGenerator) -> Self {
        Self { stack, masker }
    }

    pub fn stack(&self) -> &DownsamplingStack {
        &self.stack
    }

    pub fn masker(&self) -> &MaskGenerator {
        &self.masker
    }

    /// Pad, compute latent lengths and draw the equalized mask
    pub fn collate<R: Rng + ?Sized>(&self, samples: &[Sample], rng: &mut R) -> Result<MaskedBatch> {
        if samples.is_empty() {
            return Err(Error::shape(Stage::Collate, "empty batch"));
        }

        let wav_lens: Vec<usize> = samples.iter().map(Sample::len).collect();
        let max_len = wav_lens.iter().copied().max().unwrap_or(0);
        let mut wavs = Array2::<f32>::zeros((samples.len(), max_len));
        for (i, sample) in samples.iter().enumerate() {
            wavs.slice_mut(s![i, ..sample.len()]).assign(&sample.waveform);
        }

        let latent_lens = latent_lengths(&self.stack, &wav_lens);
        if let Some(pos) = latent_lens.iter().position(|&l| l == 0) {
            return Err(Error::shape(
                Stage::Collate,
                format!(
                    "sample '{}' has {} samples, too short for the downsampling stack",
                    samples[pos].id, wav_lens[pos]
                ),
            ));
        }
        let mask = self.masker.generate(&latent_lens, rng)?;

        Ok(MaskedBatch {
            ids: samples.iter().map(|s| s.id.clone()).collect(),
            wavs,
            wav_lens,
            latent_lens,
            mask,
        })
    }
}
