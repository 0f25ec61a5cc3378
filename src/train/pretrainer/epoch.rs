//! Epoch-level training, validation and the multi-epoch loop

use std::collections::BTreeMap;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::core::{eval_seed, Pretrainer};
use super::result::{EpochSummary, PretrainResult};
use crate::data::MaskedBatch;
use crate::error::Result;

impl Pretrainer {
    /// Train over one epoch of batches
    ///
    /// Batches that fail to load with a recoverable error still advance the
    /// micro-step counter. A window left open at the end of the epoch stays
    /// open and is completed by the next epoch's first batches.
    pub fn train_epoch<I>(&mut self, batches: I) -> Result<EpochSummary>
    where
        I: IntoIterator<Item = Result<MaskedBatch>>,
    {
        let start_step = self.state.step;
        let start_skipped = self.state.total_skipped;
        let mut summary = EpochSummary::default();
        let mut loss_sum = 0.0f64;
        let mut contributing = 0usize;

        for item in batches {
            let outcome = match item {
                Ok(batch) => self.fit_batch(&batch)?,
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(error = %e, "Failed to load batch");
                    self.skip_batch()?
                }
                Err(e) => return Err(e),
            };
            summary.micro_batches += 1;
            match outcome.objectives {
                Some(o) => {
                    loss_sum += f64::from(o.loss);
                    contributing += 1;
                }
                None => summary.dropped += 1,
            }
        }

        self.state.epoch += 1;
        summary.steps = self.state.step - start_step;
        summary.skipped_steps = self.state.total_skipped - start_skipped;
        summary.mean_loss = (contributing > 0).then(|| loss_sum / contributing as f64);

        tracing::info!(
            epoch = self.state.epoch,
            steps = summary.steps,
            micro_batches = summary.micro_batches,
            dropped = summary.dropped,
            mean_loss = summary.mean_loss,
            "Epoch complete"
        );
        Ok(summary)
    }

    /// Mean accuracy over validation batches, `None` if none succeeded
    pub fn evaluate<I>(&mut self, batches: I) -> Result<Option<f32>>
    where
        I: IntoIterator<Item = Result<MaskedBatch>>,
    {
        self.eval_rng = StdRng::seed_from_u64(eval_seed(self.config.seed));
        let mut total = 0.0f64;
        let mut count = 0usize;
        for item in batches {
            let accuracy = match item.and_then(|batch| self.evaluate_batch(&batch)) {
                Ok(acc) => acc,
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(error = %e, "Skipping validation batch");
                    continue;
                }
                Err(e) => return Err(e),
            };
            total += f64::from(accuracy);
            count += 1;
        }
        Ok((count > 0).then(|| (total / count as f64) as f32))
    }

    /// Report validation accuracy and checkpoint on the main replica
    pub fn on_validation_end(&mut self, valid_accuracy: f32) -> Result<()> {
        let step = self.state.step;
        tracing::info!(step, valid_accuracy, "Validation");
        if !self.sync.is_main() {
            return Ok(());
        }

        if let Some(tracker) = self.tracker.as_mut() {
            let mut record = BTreeMap::new();
            record.insert("valid_accuracy".to_string(), f64::from(valid_accuracy));
            tracker.log_metrics(&record, step)?;
        }
        if self.checkpointer.is_some() {
            let checkpoint = self.checkpoint(self.state.epoch, valid_accuracy);
            let keep = self.config.keep_checkpoints;
            if let Some(ckpt) = self.checkpointer.as_mut() {
                ckpt.save_and_keep_only(&checkpoint, keep)?;
            }
        }
        Ok(())
    }

    /// Train until `epochs` epochs are complete, validating after each
    ///
    /// `train_batches(epoch)` and `valid_batches(epoch)` produce the batch
    /// streams for a zero-based epoch. A resumed run continues from the
    /// restored epoch counter.
    pub fn fit<T, V, TI, VI>(
        &mut self,
        epochs: usize,
        mut train_batches: T,
        mut valid_batches: V,
    ) -> Result<PretrainResult>
    where
        T: FnMut(usize) -> TI,
        V: FnMut(usize) -> VI,
        TI: IntoIterator<Item = Result<MaskedBatch>>,
        VI: IntoIterator<Item = Result<MaskedBatch>>,
    {
        let start = Instant::now();
        let mut valid_accuracies = Vec::new();

        while self.state.epoch < epochs {
            let epoch = self.state.epoch;
            self.train_epoch(train_batches(epoch))?;
            match self.evaluate(valid_batches(epoch))? {
                Some(accuracy) => {
                    self.on_validation_end(accuracy)?;
                    valid_accuracies.push(accuracy);
                }
                None => tracing::warn!(epoch = epoch + 1, "No validation batches succeeded"),
            }
        }

        if let Some(tracker) = self.tracker.as_mut() {
            tracker.flush()?;
        }

        Ok(PretrainResult {
            epochs_completed: self.state.epoch,
            steps: self.state.step,
            avg_train_loss: self.state.avg_train_loss,
            valid_accuracies,
            skipped_steps: self.state.total_skipped,
            elapsed_secs: start.elapsed().as_secs_f64(),
        })
    }
}
