//! Configuration validation
//!
//! Rejects specifications the pipeline cannot run before any data is read.

mod error;
mod validator;


pub use error::ValidationError;
pub use validator::validate_spec;
