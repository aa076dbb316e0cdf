//! Job pipeline: Queue Monitor → VLM Gateway → Extraction Parser →
//! Validation Engine → persistence, with failures routed back to the queue.

pub mod error;
pub mod processor;
pub mod scheduler;

pub use error::ProcessingError;
pub use processor::{JobOutcome, JobProcessor};
pub use scheduler::{Scheduler, SchedulerConfig};
