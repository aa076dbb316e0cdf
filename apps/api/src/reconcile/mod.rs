//! Validation & Reconciliation Engine.
//!
//! Pure functions: a `CandidateExtraction` goes in, a `ReconciledReceipt`
//! comes out. Arithmetic disagreements lower confidence scores instead of
//! rejecting the extraction; only structurally unusable input is an error.

pub mod engine;
pub mod tolerance;

use thiserror::Error;

pub use engine::{reconcile, FlagKind, ItemFlag, ReconciledReceipt, ReconciliationReport};
pub use tolerance::Tolerances;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("extraction contains no items")]
    NoItems,

    #[error("no item has a resolvable price")]
    NoResolvablePrices,
}
