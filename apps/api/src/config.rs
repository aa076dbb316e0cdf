use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::queue::RetryPolicy;
use crate::reconcile::Tolerances;
use crate::vlm::PromptVersion;

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub port: u16,
    pub rust_log: String,

    pub vlm_base_url: String,
    pub vlm_model: String,
    pub vlm_timeout: Duration,
    pub prompt_version: PromptVersion,

    pub worker_id: String,
    pub scheduler_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub stale_job_after: Duration,
    pub retry: RetryPolicy,

    pub tolerances: Tolerances,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let max_retries: i32 = parse_env("MAX_RETRIES", "3")?;
        anyhow::ensure!(max_retries > 0, "MAX_RETRIES must be at least 1");
        let max_concurrent_jobs: usize = parse_env("MAX_CONCURRENT_JOBS", "2")?;
        anyhow::ensure!(max_concurrent_jobs > 0, "MAX_CONCURRENT_JOBS must be at least 1");

        let vlm_timeout = Duration::from_secs(parse_env("VLM_TIMEOUT_SECS", "120")?);
        let stale_job_after = Duration::from_secs(parse_env("STALE_JOB_SECS", "600")?);
        check_stale_lease(stale_job_after, vlm_timeout)?;

        let tolerances = Tolerances {
            price_relative: parse_env::<Decimal>("RECONCILE_PRICE_TOLERANCE", "0.05")?,
            tax_epsilon: parse_env::<Decimal>("RECONCILE_TAX_EPSILON", "0.02")?,
            total_absolute: parse_env::<Decimal>("RECONCILE_TOTAL_ABS_TOLERANCE", "0.05")?,
            total_relative: parse_env::<Decimal>("RECONCILE_TOTAL_REL_TOLERANCE", "0.01")?,
            ..Tolerances::default()
        };

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            s3_bucket: require_env("S3_BUCKET")?,
            s3_endpoint: require_env("S3_ENDPOINT")?,
            aws_access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            port: parse_env("PORT", "8080")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),

            vlm_base_url: optional_env("VLM_BASE_URL", "http://localhost:11434"),
            vlm_model: optional_env("VLM_MODEL", "llama3.2-vision"),
            vlm_timeout,
            prompt_version: parse_env("PROMPT_VERSION", "v2")?,

            worker_id: std::env::var("WORKER_ID")
                .unwrap_or_else(|_| format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8])),
            scheduler_interval: Duration::from_secs(parse_env("SCHEDULER_INTERVAL_SECS", "30")?),
            max_concurrent_jobs,
            stale_job_after,
            retry: RetryPolicy {
                max_retries,
                initial_delay: Duration::from_secs(parse_env("RETRY_INITIAL_DELAY_SECS", "30")?),
                max_delay: Duration::from_secs(parse_env("RETRY_MAX_DELAY_SECS", "900")?),
                ..RetryPolicy::default()
            }
            .with_jitter(parse_env("RETRY_JITTER", "0.2")?),

            tolerances,
        })
    }
}

/// A job still inside its VLM call must never look stale, or the sweep would
/// hand it to a second worker.
fn check_stale_lease(stale_job_after: Duration, vlm_timeout: Duration) -> Result<()> {
    anyhow::ensure!(
        stale_job_after > vlm_timeout,
        "STALE_JOB_SECS ({}) must be greater than VLM_TIMEOUT_SECS ({})",
        stale_job_after.as_secs(),
        vlm_timeout.as_secs()
    );
    Ok(())
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = optional_env(key, default);
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{key} has invalid value '{raw}': {e}"))
}
