//! Extraction parser: turns raw VLM text into a typed `CandidateExtraction`.
//!
//! The parser never trusts the model to emit clean JSON. It locates the JSON
//! body inside surrounding prose or code fences, repairs trivially broken
//! syntax, and coerces loosely typed fields. Arithmetic is not checked here;
//! that is the reconciliation engine's job.

pub mod candidate;
pub mod coerce;
pub mod parser;
pub mod repair;

use thiserror::Error;

pub use candidate::{CandidateExtraction, CandidateItem, CandidateReceipt};
pub use parser::parse;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no JSON object or array found in model output")]
    NoJson,

    #[error("model output is not recoverable as JSON: {0}")]
    Unrecoverable(String),

    #[error("model output has no items array")]
    MissingItems,

    #[error("item {index} is unusable: {reason}")]
    InvalidItem { index: usize, reason: String },
}
