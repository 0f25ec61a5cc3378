//! Cosine-similarity InfoNCE loss

use ndarray::{Array1, Array3, ArrayView1, ArrayView3, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, Stage};
use crate::train::{ContrastiveObjective, ObjectiveOutput};

const NORM_EPS: f32 = 1e-8;

/// InfoNCE over cosine similarities scaled by `1 / temperature`
///
/// For each masked position the positive target competes with its
/// negatives in a softmax; the loss is the mean negative log-probability of
/// the positive. Targets and negatives are treated as constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InfoNce {
    pub temperature: f32,
}

impl Default for InfoNce {
    fn default() -> Self {
        Self { temperature: 0.1 }
    }
}

impl InfoNce {
    pub fn new(temperature: f32) -> Result<Self> {
        if !(temperature > 0.0) {
            return Err(Error::Config(format!("temperature must be > 0, got {temperature}")));
        }
        Ok(Self { temperature })
    }
}

fn norm(v: ArrayView1<'_, f32>) -> f32 {
    v.dot(&v).sqrt().max(NORM_EPS)
}

impl ContrastiveObjective for InfoNce {
    fn evaluate(
        &self,
        embeddings: ArrayView3<'_, f32>,
        targets: ArrayView3<'_, f32>,
        negatives: ArrayView4<'_, f32>,
    ) -> Result<ObjectiveOutput> {
        let (batch, time, channels) = embeddings.dim();
        let num_neg = negatives.dim().0;
        if targets.dim() != embeddings.dim()
            || negatives.dim() != (num_neg, batch, time, channels)
        {
            return Err(Error::shape(
                Stage::Forward,
                format!(
                    "objective inputs disagree: embeddings {:?}, targets {:?}, negatives {:?}",
                    embeddings.dim(),
                    targets.dim(),
                    negatives.dim()
                ),
            ));
        }
        let positions = batch * time;
        if positions == 0 {
            return Err(Error::shape(Stage::Forward, "no masked positions"));
        }

        let inv_t = 1.0 / self.temperature;
        let mut grad = Array3::<f32>::zeros((batch, time, channels));
        let mut loss = 0.0f64;
        let mut correct = 0usize;

        for b in 0..batch {
            for t in 0..time {
                let e = embeddings.slice(ndarray::s![b, t, ..]);
                let e_norm = norm(e);
                let candidates: Vec<ArrayView1<'_, f32>> =
                    std::iter::once(targets.slice(ndarray::s![b, t, ..]))
                        .chain((0..num_neg).map(|n| negatives.slice(ndarray::s![n, b, t, ..])))
                        .collect();

                let cos: Vec<f32> =
                    candidates.iter().map(|c| e.dot(c) / (e_norm * norm(*c))).collect();
                let logits: Array1<f32> = cos.iter().map(|&c| c * inv_t).collect();
                let max = logits.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
                let exp = logits.mapv(|x| (x - max).exp());
                let denom = exp.sum();
                loss += f64::from((denom.ln() + max) - logits[0]);
                if logits.iter().skip(1).all(|&x| logits[0] > x) {
                    correct += 1;
                }

                // dL/d(logit_k) = (p_k - [k == 0]) / positions
                let mut g = grad.slice_mut(ndarray::s![b, t, ..]);
                for (k, c) in candidates.iter().enumerate() {
                    let p = exp[k] / denom;
                    let coeff = (p - if k == 0 { 1.0 } else { 0.0 }) * inv_t / positions as f32;
                    let c_norm = norm(*c);
                    // d cos(e, c) / de = c / (|e||c|) - cos * e / |e|^2
                    g.scaled_add(coeff / (e_norm * c_norm), c);
                    g.scaled_add(-coeff * cos[k] / (e_norm * e_norm), &e);
                }
            }
        }

        Ok(ObjectiveOutput {
            loss: (loss / positions as f64) as f32,
            accuracy: correct as f32 / positions as f32,
            grad_embeddings: grad,
            grad_targets: None,
            grad_negatives: None,
        })
    }
}
