#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod cache;
pub mod pipeline;
pub mod types;
pub mod utils;

pub use cache::{CacheBatch, CachePolicy};
pub use pipeline::{BatchPipeline, BatchRequest, InferenceParams, InferenceTuning, RetryPolicy};
pub use types::{InferenceOutcome, SystemPrompts};

use common::{error::AppError, utils::config::AppConfig};

/// Runs `request` against the service configured in `config` with default
/// tuning, returning one answer per prompt in prompt order.
pub async fn run(
    config: &AppConfig,
    request: BatchRequest,
) -> Result<Vec<InferenceOutcome>, AppError> {
    let tuning = InferenceTuning {
        progress_interval: std::time::Duration::from_secs(config.progress_interval_secs),
        ..InferenceTuning::default()
    };
    BatchPipeline::new(config, tuning)?.run(request).await
}
