//! VLM Gateway: the single point where receipt images reach the vision model.
//!
//! Stateless and non-retrying. Retry belongs to the job queue so concurrency
//! accounting stays in one place.

pub mod image;
pub mod ollama;
pub mod prompts;

use async_trait::async_trait;
use thiserror::Error;

pub use image::{ImageSource, S3ImageSource};
pub use ollama::OllamaGateway;
pub use prompts::PromptVersion;

#[derive(Debug, Error)]
pub enum VlmError {
    /// Connection refused, timeout, or the image store is unreachable.
    #[error("VLM unavailable: {0}")]
    Unavailable(String),

    /// The model endpoint answered with an error payload or an unreadable body.
    #[error("VLM model error (status {status}): {message}")]
    Model { status: u16, message: String },

    /// The referenced image does not exist. Retrying cannot help.
    #[error("receipt image '{0}' not found")]
    ImageMissing(String),
}

/// Sampling parameters sent with every request. Fixed so output variance
/// stays bounded; callers cannot override them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub seed: i64,
    pub num_predict: u32,
}

pub const SAMPLING: SamplingConfig = SamplingConfig {
    temperature: 0.1,
    seed: 42,
    num_predict: 4096,
};

/// Raw model output plus what is needed to attribute it.
#[derive(Debug, Clone)]
pub struct VlmOutput {
    pub text: String,
    pub model: String,
    pub prompt_version: PromptVersion,
    pub eval_count: Option<u64>,
}

#[async_trait]
pub trait VlmGateway: Send + Sync {
    /// Sends the image behind `image_ref` with the versioned prompt and returns
    /// the model's raw text.
    async fn extract(
        &self,
        image_ref: &str,
        prompt_version: PromptVersion,
    ) -> Result<VlmOutput, VlmError>;
}
