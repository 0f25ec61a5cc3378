//! Reference implementations of the model and objective contracts
//!
//! [`ReferenceModel`] is a deliberately small linear model: a frozen random
//! frame projection as the latent extractor, a windowed-average context
//! encoder with a learned mask embedding, and a linear feature projection.
//! [`InfoNce`] is a cosine-similarity contrastive loss. Together they let
//! the engine run end to end without an external network.

mod infonce;
mod reference;

pub use infonce::InfoNce;
pub use reference::{ReferenceModel, ReferenceModelConfig};
