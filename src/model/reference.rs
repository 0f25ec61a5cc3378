//! Small linear model implementing the pretraining stages

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::autograd::Tensor;
use crate::data::{latent_length, DownsamplingStack, MaskedBatch};
use crate::error::{Error, Result, Stage};
use crate::train::{BackwardSignal, EncoderOutput, PretrainModel, QuantizerOutput};

const EXTRACTOR: usize = 0;
const MASK_EMB: usize = 1;
const ENCODER: usize = 2;
const PROJECTION: usize = 3;

/// Shape of a [`ReferenceModel`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceModelConfig {
    #[serde(default)]
    pub stack: DownsamplingStack,
    /// Channels of latent frames and targets
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,
    /// Channels of the context encoder
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    /// Neighbors on each side averaged by the context encoder
    #[serde(default = "default_context")]
    pub context: usize,
}

fn default_latent_dim() -> usize {
    16
}

fn default_hidden_dim() -> usize {
    32
}

fn default_context() -> usize {
    2
}

impl Default for ReferenceModelConfig {
    fn default() -> Self {
        Self {
            stack: DownsamplingStack::default(),
            latent_dim: default_latent_dim(),
            hidden_dim: default_hidden_dim(),
            context: default_context(),
        }
    }
}

/// Linear reference model
///
/// - latent extractor: frozen random projection of each `total_stride`
///   frame of samples to `latent_dim` channels
/// - latent encoder: masked frames replaced by a learned embedding, then a
///   `2 * context + 1` window average and a linear map to `hidden_dim`
/// - feature projection: linear map back to `latent_dim`
/// - target quantizer: none; targets are the masked latents
#[derive(Debug, Clone)]
pub struct ReferenceModel {
    config: ReferenceModelConfig,
    frame: usize,
    params: Vec<Tensor>,
}

impl ReferenceModel {
    pub fn new(config: ReferenceModelConfig, seed: u64) -> Result<Self> {
        config.stack.validate()?;
        if config.latent_dim == 0 || config.hidden_dim == 0 {
            return Err(Error::Config("model dimensions must be >= 1".into()));
        }
        let frame = config.stack.total_stride();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut init = |len: usize, fan_in: usize| -> Array1<f32> {
            let bound = (1.0 / fan_in as f32).sqrt();
            (0..len).map(|_| rng.random_range(-bound..bound)).collect()
        };

        let (c_lat, c_hid) = (config.latent_dim, config.hidden_dim);
        let mut extractor = Tensor::new("latent_extractor.weight", init(c_lat * frame, frame));
        extractor.set_requires_grad(false);
        let params = vec![
            extractor,
            Tensor::new("latent_encoder.mask_emb", init(c_lat, c_lat)),
            Tensor::new("latent_encoder.weight", init(c_hid * c_lat, c_lat)),
            Tensor::new("feat_proj.weight", init(c_lat * c_hid, c_hid)),
        ];
        Ok(Self { config, frame, params })
    }

    pub fn config(&self) -> &ReferenceModelConfig {
        &self.config
    }

    fn matrix(&self, index: usize, rows: usize, cols: usize) -> Result<ArrayView2<'_, f32>> {
        self.params[index]
            .data()
            .view()
            .into_shape_with_order((rows, cols))
            .map_err(|e| {
                Error::shape(Stage::Forward, format!("{}: {e}", self.params[index].name()))
            })
    }

    /// Replace masked frames with the mask embedding
    fn masked_input(
        &self,
        latents: ArrayView3<'_, f32>,
        mask: ArrayView2<'_, bool>,
    ) -> Array3<f32> {
        let mut x = latents.to_owned();
        let mask_emb = self.params[MASK_EMB].data();
        for ((b, t), &m) in mask.indexed_iter() {
            if m {
                x.slice_mut(s![b, t, ..]).assign(mask_emb);
            }
        }
        x
    }

    /// Window `[lo, hi)` averaged for step `t` of a row of `valid` steps
    fn window(&self, t: usize, valid: usize) -> (usize, usize) {
        let lo = t.saturating_sub(self.config.context);
        let hi = (t + self.config.context + 1).min(valid.max(t + 1));
        (lo, hi)
    }

    /// Unpadded latent steps per row from relative waveform lengths
    fn valid_steps(&self, time: usize, wav_lens: ArrayView1<'_, f32>) -> Vec<usize> {
        wav_lens
            .iter()
            .map(|&rel| ((rel * time as f32).round() as usize).clamp(1, time.max(1)))
            .collect()
    }

    /// Windowed context averages (B, T, C_lat) of the masked input
    fn context(&self, x: &Array3<f32>, valid: &[usize]) -> Array3<f32> {
        let (batch, time, channels) = x.dim();
        let mut ctx = Array3::<f32>::zeros((batch, time, channels));
        for b in 0..batch {
            for t in 0..time {
                let (lo, hi) = self.window(t, valid[b]);
                let mean = x.slice(s![b, lo..hi, ..]).mean_axis(ndarray::Axis(0));
                if let Some(mean) = mean {
                    ctx.slice_mut(s![b, t, ..]).assign(&mean);
                }
            }
        }
        ctx
    }
}

impl PretrainModel for ReferenceModel {
    fn latent_extractor(&self, wavs: ArrayView2<'_, f32>) -> Result<Array3<f32>> {
        let (batch, width) = wavs.dim();
        let time = latent_length(&self.config.stack, width);
        if time == 0 {
            return Err(Error::shape(
                Stage::Forward,
                format!("{width} samples is shorter than one latent frame"),
            ));
        }
        let c_lat = self.config.latent_dim;
        let weight = self.matrix(EXTRACTOR, c_lat, self.frame)?;
        let mut latents = Array3::<f32>::zeros((batch, time, c_lat));
        for b in 0..batch {
            for t in 0..time {
                let start = t * self.frame;
                let end = (start + self.frame).min(width);
                let mut frame = Array1::<f32>::zeros(self.frame);
                if start < end {
                    frame.slice_mut(s![..end - start]).assign(&wavs.slice(s![b, start..end]));
                }
                latents.slice_mut(s![b, t, ..]).assign(&weight.dot(&frame));
            }
        }
        Ok(latents)
    }

    fn latent_encoder(
        &self,
        latents: ArrayView3<'_, f32>,
        mask: ArrayView2<'_, bool>,
        wav_lens: ArrayView1<'_, f32>,
    ) -> Result<EncoderOutput> {
        let (batch, time, _) = latents.dim();
        if mask.dim() != (batch, time) || wav_lens.len() != batch {
            return Err(Error::shape(
                Stage::Forward,
                format!(
                    "latents are ({batch}, {time}) but mask is {:?} with {} lengths",
                    mask.dim(),
                    wav_lens.len()
                ),
            ));
        }
        let valid = self.valid_steps(time, wav_lens);
        let x = self.masked_input(latents, mask);
        let ctx = self.context(&x, &valid);

        let weight = self.matrix(ENCODER, self.config.hidden_dim, self.config.latent_dim)?;
        let mut embeddings = Array3::<f32>::zeros((batch, time, self.config.hidden_dim));
        for b in 0..batch {
            for t in 0..time {
                embeddings.slice_mut(s![b, t, ..]).assign(&weight.dot(&ctx.slice(s![b, t, ..])));
            }
        }

        let num_masked = mask.iter().filter(|&&m| m).count();
        let total_valid: usize = valid.iter().sum();
        let ratio_masked =
            if total_valid > 0 { num_masked as f32 / total_valid as f32 } else { 0.0 };
        Ok(EncoderOutput { embeddings, num_masked, ratio_masked })
    }

    fn feature_projection(&self, embeddings: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let (batch, time, _) = embeddings.dim();
        let weight = self.matrix(PROJECTION, self.config.latent_dim, self.config.hidden_dim)?;
        let mut out = Array3::<f32>::zeros((batch, time, self.config.latent_dim));
        for b in 0..batch {
            for t in 0..time {
                out.slice_mut(s![b, t, ..]).assign(&weight.dot(&embeddings.slice(s![b, t, ..])));
            }
        }
        Ok(out)
    }

    fn target_quantizer(&self, masked_latents: ArrayView3<'_, f32>) -> Result<QuantizerOutput> {
        Ok(QuantizerOutput { targets: masked_latents.to_owned(), stats: None })
    }

    fn parameters(&self) -> &[Tensor] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Tensor] {
        &mut self.params
    }

    fn backward(&mut self, batch: &MaskedBatch, signal: &BackwardSignal) -> Result<()> {
        let latents = self.latent_extractor(batch.wavs.view())?;
        let (batch_size, time, _) = latents.dim();
        let rel = batch.relative_lens();
        let valid = self.valid_steps(time, rel.view());
        let x = self.masked_input(latents.view(), batch.mask.view());
        let ctx = self.context(&x, &valid);

        let (c_lat, c_hid) = (self.config.latent_dim, self.config.hidden_dim);
        let enc = self.matrix(ENCODER, c_hid, c_lat)?.to_owned();
        let proj = self.matrix(PROJECTION, c_lat, c_hid)?.to_owned();

        let mut grad_proj = Array2::<f32>::zeros((c_lat, c_hid));
        let mut grad_enc = Array2::<f32>::zeros((c_hid, c_lat));
        let mut grad_mask = Array1::<f32>::zeros(c_lat);

        for b in 0..batch_size {
            let positions: Vec<usize> = batch
                .mask
                .row(b)
                .iter()
                .enumerate()
                .filter(|&(_, &m)| m)
                .map(|(t, _)| t)
                .collect();
            for (j, &t) in positions.iter().enumerate() {
                let g_out = signal.grad_embeddings.slice(s![b, j, ..]);
                let c = ctx.slice(s![b, t, ..]);
                let h = enc.dot(&c);

                // out = P h, h = E c
                let outer_p = g_out
                    .to_owned()
                    .insert_axis(ndarray::Axis(1))
                    .dot(&h.view().insert_axis(ndarray::Axis(0)));
                grad_proj += &outer_p;
                let g_h = proj.t().dot(&g_out);
                let outer_e =
                    g_h.view().insert_axis(ndarray::Axis(1)).dot(&c.insert_axis(ndarray::Axis(0)));
                grad_enc += &outer_e;

                // c = mean of x over the window; masked x are the mask embedding
                let g_c = enc.t().dot(&g_h);
                let (lo, hi) = self.window(t, valid[b]);
                let masked_in_window = (lo..hi).filter(|&s| batch.mask[[b, s]]).count();
                if masked_in_window > 0 {
                    grad_mask.scaled_add(masked_in_window as f32 / (hi - lo) as f32, &g_c);
                }
            }
        }

        self.params[MASK_EMB].accumulate_grad(grad_mask.view())?;
        let grad_enc = Array1::from_iter(grad_enc.iter().copied());
        self.params[ENCODER].accumulate_grad(grad_enc.view())?;
        let grad_proj = Array1::from_iter(grad_proj.iter().copied());
        self.params[PROJECTION].accumulate_grad(grad_proj.view())?;
        Ok(())
    }
}
