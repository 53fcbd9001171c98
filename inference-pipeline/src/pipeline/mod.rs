mod config;
mod inference;
mod merger;
mod orchestrator;
mod services;
mod worker;

pub use config::{
    BatchRequest, InferenceParams, InferenceTuning, RetryPolicy, ServiceConfig, DEFAULT_SEEDS,
};
pub use inference::InferenceClient;
pub use merger::{merge_batch, merge_results};
pub use orchestrator::{run_chunks, spawn_progress_monitor, ChunkFailure, PoolReport};
#[allow(clippy::module_name_repetitions)]
pub use services::{
    ChatMessage, ChatReply, ChatRequest, CompletionService, HttpCompletionService,
};
pub use worker::{process_chunk, ChunkReport};

use std::{sync::Arc, time::Instant};

use common::{error::AppError, utils::config::AppConfig};
use tracing::{info, warn};

use crate::{
    cache::{select_or_create, CacheBatch},
    types::{InferenceOutcome, PromptSet},
    utils::truncation::PromptTruncator,
};

/// Drives a batch end to end: cache selection, parallel chunk workers, merge.
pub struct BatchPipeline {
    client: Arc<InferenceClient>,
    tuning: InferenceTuning,
}

impl BatchPipeline {
    /// Pipeline talking to the HTTP service described by `config`.
    pub fn new(config: &AppConfig, tuning: InferenceTuning) -> Result<Self, AppError> {
        let service = HttpCompletionService::new(
            ServiceConfig {
                service_url: config.service_url.clone(),
                api_key: config.api_key.clone(),
            },
            tuning.request_timeout,
        )?;
        Self::with_service(Arc::new(service), tuning)
    }

    pub fn with_service(
        service: Arc<dyn CompletionService>,
        tuning: InferenceTuning,
    ) -> Result<Self, AppError> {
        let truncator = Arc::new(PromptTruncator::new(tuning.prompt_token_limit)?);
        let client = Arc::new(InferenceClient::new(
            service,
            truncator,
            tuning.retry.clone(),
        ));
        Ok(Self { client, tuning })
    }

    /// Answers every prompt of `request` and returns the answers in prompt
    /// order. Already answered rows of a resumed batch are not re-sent.
    #[tracing::instrument(
        skip_all,
        fields(model = %request.params.model, prompts = request.prompts.len())
    )]
    pub async fn run(&self, request: BatchRequest) -> Result<Vec<InferenceOutcome>, AppError> {
        let BatchRequest {
            prompts,
            system_prompts,
            params,
            output_path,
            parallelism,
            cache_dir,
            cache_policy,
        } = request;

        let prompt_set = PromptSet::new(prompts, system_prompts)?;
        if prompt_set.is_empty() {
            return Err(AppError::Validation("no prompts to run".into()));
        }
        params.seed()?;
        let parallelism = parallelism.max(1);

        let started = Instant::now();
        let batch = select_or_create(&prompt_set, &cache_dir, parallelism, &cache_policy).await?;
        let chunks = batch.verified_chunks().await?;
        info!(
            batch = %batch.name(),
            chunks = chunks.len(),
            pattern = params.pattern.as_str(),
            "running batch"
        );

        let monitor = spawn_progress_monitor(chunks.clone(), self.tuning.progress_interval);
        let report = run_chunks(
            &chunks,
            parallelism,
            Arc::clone(&self.client),
            Arc::new(params),
        )
        .await;
        monitor.abort();

        if !report.all_succeeded() {
            return Err(failed_batch_error(&batch, &report));
        }

        info!("merging results");
        let answers = merge_results(&chunks, output_path.as_deref()).await?;
        if answers.len() != prompt_set.len() {
            return Err(AppError::CorruptRows {
                path: batch.dir().to_path_buf(),
                reason: format!(
                    "merged {} answers for {} prompts",
                    answers.len(),
                    prompt_set.len()
                ),
            });
        }

        let parse_failures = answers.iter().filter(|a| !a.is_parsed()).count();
        if parse_failures > 0 {
            warn!(parse_failures, "some prompts produced no parsable answer");
        }
        info!(
            answers = answers.len(),
            resumed_rows = report.completed.iter().map(|c| c.resumed_from).sum::<usize>(),
            total_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "batch finished"
        );
        Ok(answers)
    }
}

fn failed_batch_error(batch: &CacheBatch, report: &PoolReport) -> AppError {
    let failed: Vec<String> = report
        .failed
        .iter()
        .map(|failure| format!("chunk {}: {}", failure.index, failure.error))
        .collect();
    AppError::Processing(format!(
        "{} chunk(s) failed in {}; re-run to resume ({})",
        failed.len(),
        batch.dir().display(),
        failed.join("; ")
    ))
}
