use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use bytes::Bytes;
use tracing::debug;

use crate::vlm::VlmError;

/// Where receipt images are read from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn load(&self, image_ref: &str) -> Result<Bytes, VlmError>;
}

/// Reads `image_ref` as an object key in the uploads bucket.
#[derive(Clone)]
pub struct S3ImageSource {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ImageSource {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ImageSource for S3ImageSource {
    async fn load(&self, image_ref: &str) -> Result<Bytes, VlmError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(image_ref)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    VlmError::ImageMissing(image_ref.to_string())
                } else {
                    VlmError::Unavailable(format!(
                        "S3 read of s3://{}/{image_ref} failed: {}",
                        self.bucket,
                        DisplayErrorContext(&e)
                    ))
                }
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| VlmError::Unavailable(format!("S3 body read failed: {e}")))?
            .into_bytes();

        debug!("Loaded {} bytes from s3://{}/{}", bytes.len(), self.bucket, image_ref);
        Ok(bytes)
    }
}
