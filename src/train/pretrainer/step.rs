//! Micro-batch and optimizer-step operations

use chrono::Utc;
use ndarray::ArrayView4;

use super::core::{Pretrainer, Window};
use crate::data::MaskedBatch;
use crate::error::{Error, Result, Stage};
use crate::optim::clip_grad_norm;
use crate::train::forward::{composite_loss, gather_masked, ForwardResult, Objectives};
use crate::train::negatives::{scatter_negative_grads, NegativeIndices};
use crate::train::stages::{BackwardSignal, ObjectiveOutput};
use crate::train::state::StepLog;

/// What happened on one call to [`Pretrainer::fit_batch`]
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Objectives of this micro-batch; `None` if it was dropped
    pub objectives: Option<Objectives>,
    /// This micro-batch closed an accumulation window
    pub boundary: bool,
    /// The window's update was skipped for non-finite values
    pub skipped: bool,
    /// Log record, emitted on the log cadence
    pub log: Option<StepLog>,
}

impl Pretrainer {
    /// Run the model stages on a batch
    pub fn compute_forward(&self, batch: &MaskedBatch) -> Result<ForwardResult> {
        let latents = self.model.latent_extractor(batch.wavs.view())?;
        let (b, t, _) = latents.dim();
        if (b, t) != batch.mask.dim() {
            return Err(Error::shape(
                Stage::Forward,
                format!("latents are ({b}, {t}) but the mask is {:?}", batch.mask.dim()),
            ));
        }

        let rel_lens = batch.relative_lens();
        let encoded =
            self.model.latent_encoder(latents.view(), batch.mask.view(), rel_lens.view())?;
        let masked = gather_masked(encoded.embeddings.view(), batch.mask.view())?;
        let embeddings = self.model.feature_projection(masked.view())?;

        let masked_latents = gather_masked(latents.view(), batch.mask.view())?;
        let quantized = self.model.target_quantizer(masked_latents.view())?;
        if quantized.targets.dim() != embeddings.dim() {
            return Err(Error::shape(
                Stage::Forward,
                format!(
                    "targets {:?} do not match embeddings {:?}",
                    quantized.targets.dim(),
                    embeddings.dim()
                ),
            ));
        }

        Ok(ForwardResult {
            embeddings,
            targets: quantized.targets,
            num_masked: encoded.num_masked,
            ratio_masked: encoded.ratio_masked,
            quantizer: quantized.stats,
        })
    }

    /// Sample negatives and evaluate the contrastive objective
    pub fn compute_objectives(
        &mut self,
        forward: &ForwardResult,
    ) -> Result<(Objectives, ObjectiveOutput, NegativeIndices)> {
        let (negatives, indices) = self.negatives.sample(forward.targets.view(), &mut self.rng)?;
        self.score(forward, negatives.view(), indices)
    }

    /// Objective and composite loss for already-drawn negatives
    fn score(
        &self,
        forward: &ForwardResult,
        negatives: ArrayView4<'_, f32>,
        indices: NegativeIndices,
    ) -> Result<(Objectives, ObjectiveOutput, NegativeIndices)> {
        let output = self
            .objective
            .evaluate(forward.embeddings.view(), forward.targets.view(), negatives)?;

        let diversity = forward.quantizer.map(|q| q.diversity_loss);
        let total_loss = composite_loss(
            output.loss,
            diversity,
            self.config.diversity_loss_weight,
            forward.num_masked,
        );
        let objectives = Objectives {
            loss: output.loss,
            total_loss,
            accuracy: output.accuracy,
            num_masked: forward.num_masked,
            ratio_masked: forward.ratio_masked,
            quantizer: forward.quantizer,
        };
        Ok((objectives, output, indices))
    }

    /// Forward plus backward; gradients land in the parameter buffers
    fn accumulate(&mut self, batch: &MaskedBatch) -> Result<Objectives> {
        let forward = self.compute_forward(batch)?;
        let (objectives, output, indices) = self.compute_objectives(&forward)?;

        let scale = self.scaler.scale() / self.config.accumulation_factor as f32;
        let folded = output.grad_negatives.map(|g| scatter_negative_grads(g.view(), &indices));
        let grad_targets = match (output.grad_targets, folded) {
            (Some(t), Some(n)) => Some(t + &n),
            (t, n) => t.or(n),
        };
        let diversity_coeff = match forward.quantizer {
            Some(_) if self.config.diversity_loss_weight != 0.0 => {
                self.config.diversity_loss_weight * forward.num_masked as f32
            }
            _ => 0.0,
        };
        let signal = BackwardSignal {
            grad_embeddings: output.grad_embeddings * scale,
            grad_targets: grad_targets.map(|g| g * scale),
            diversity_coeff,
            scale,
        };
        self.model.backward(batch, &signal)?;
        Ok(objectives)
    }

    /// Train on one micro-batch
    ///
    /// Gradients are only synchronized and applied when this micro-batch
    /// closes an accumulation window. A batch with a degenerate shape is
    /// logged and contributes no gradient, but still counts toward the
    /// window so every replica reaches the boundary together.
    pub fn fit_batch(&mut self, batch: &MaskedBatch) -> Result<StepOutcome> {
        self.micro_step(Some(batch))
    }

    /// Count a micro-batch that could not be loaded
    pub fn skip_batch(&mut self) -> Result<StepOutcome> {
        self.micro_step(None)
    }

    fn micro_step(&mut self, batch: Option<&MaskedBatch>) -> Result<StepOutcome> {
        self.state.micro_step += 1;
        let boundary = self.state.micro_step.is_multiple_of(self.config.accumulation_factor as u64);

        let objectives = match batch.map(|b| self.accumulate(b)) {
            Some(Ok(objectives)) => Some(objectives),
            Some(Err(e)) if !e.is_fatal() => {
                tracing::warn!(micro_step = self.state.micro_step, error = %e, "Dropping batch");
                None
            }
            Some(Err(e)) => return Err(e),
            None => None,
        };
        if let Some(o) = objectives {
            self.window.add(o);
        }

        let mut outcome = StepOutcome { objectives, boundary, skipped: false, log: None };
        if boundary {
            let (skipped, log) = self.finish_window()?;
            outcome.skipped = skipped;
            outcome.log = log;
        }
        Ok(outcome)
    }

    /// Synchronize, validate, step, and advance schedules
    fn finish_window(&mut self) -> Result<(bool, Option<StepLog>)> {
        let step = self.state.step;
        let window = std::mem::replace(&mut self.window, Window::new());

        self.sync.all_reduce_grads(self.model.parameters_mut(), step)?;

        let grads_finite = self.scaler.unscale_grads(self.model.parameters_mut());
        // Losses are replica-local; every replica must skip or step together
        let valid = self.sync.all_agree(grads_finite && window.all_finite, step)?;
        if valid {
            if let Some(max_norm) = self.config.max_grad_norm {
                clip_grad_norm(self.model.parameters_mut(), max_norm);
            }
            self.optimizer.step(self.model.parameters_mut());
            self.state.consecutive_skipped = 0;
        } else {
            self.state.consecutive_skipped += 1;
            self.state.total_skipped += 1;
            tracing::warn!(
                step,
                loss_scale = self.scaler.scale(),
                consecutive = self.state.consecutive_skipped,
                "Non-finite gradients or loss, skipping update"
            );
        }
        self.scaler.update(valid);
        self.state.step += 1;
        self.optimizer.zero_grad(self.model.parameters_mut());

        if self.state.consecutive_skipped > self.config.nonfinite_patience {
            return Err(Error::NumericInstability {
                step,
                reason: format!(
                    "{} consecutive updates had non-finite gradients (stage: {})",
                    self.state.consecutive_skipped,
                    Stage::OptimizerStep
                ),
            });
        }

        self.apply_schedules();

        if valid {
            if let Some(mean) = window.mean_loss() {
                self.state.update_average(mean);
            }
        }

        let log = match window.last {
            Some(last) if self.state.step.is_multiple_of(self.config.log_interval) => {
                Some(self.emit_log(&last)?)
            }
            _ => None,
        };
        Ok((!valid, log))
    }

    fn emit_log(&mut self, objectives: &Objectives) -> Result<StepLog> {
        let run_time = self.state.mark_log(Utc::now());
        let log = StepLog::new(
            self.state.step,
            objectives,
            self.optimizer.lr(),
            self.state.avg_train_loss,
            run_time,
        );
        tracing::info!(
            step = log.step,
            loss = log.loss,
            total_loss = log.total_loss,
            accuracy = log.accuracy,
            ratio_masked = log.ratio_masked,
            lr = log.lr,
            avg_loss = log.avg_loss,
            run_time = log.run_time,
            "Update"
        );
        if self.sync.is_main() {
            if let Some(tracker) = self.tracker.as_mut() {
                tracker.log_metrics(&log.to_record(), log.step)?;
            }
        }
        Ok(log)
    }

    /// Accuracy of one batch, without touching gradients or training state
    ///
    /// Negatives come from the evaluation RNG, so validation never shifts
    /// the negatives training draws next.
    pub fn evaluate_batch(&mut self, batch: &MaskedBatch) -> Result<f32> {
        let forward = self.compute_forward(batch)?;
        let (negatives, indices) =
            self.negatives.sample(forward.targets.view(), &mut self.eval_rng)?;
        let (objectives, _, _) = self.score(&forward, negatives.view(), indices)?;
        Ok(objectives.accuracy)
    }
}
