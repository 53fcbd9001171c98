use std::{sync::Arc, time::Duration};

use common::{error::AppError, storage::rows};
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, error, info};

use super::{
    config::InferenceParams,
    inference::InferenceClient,
    worker::{process_chunk, ChunkReport},
};
use crate::cache::ChunkFiles;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub index: usize,
    pub error: String,
}

/// Outcome of one pass over every chunk of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub completed: Vec<ChunkReport>,
    pub failed: Vec<ChunkFailure>,
}

impl PoolReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Runs one isolated worker per chunk, at most `parallelism` at a time, and
/// waits for all of them.
///
/// A failing or panicking worker only takes its own chunk down. It is not
/// retried here; its progress file stays resumable for the next run.
pub async fn run_chunks(
    chunks: &[ChunkFiles],
    parallelism: usize,
    client: Arc<InferenceClient>,
    params: Arc<InferenceParams>,
) -> PoolReport {
    let parallelism = parallelism.max(1);
    let slots = Arc::new(Semaphore::new(parallelism));
    info!(chunks = chunks.len(), parallelism, "inferencing");

    let handles: Vec<(usize, JoinHandle<Result<ChunkReport, AppError>>)> = chunks
        .iter()
        .cloned()
        .map(|files| {
            let slots = Arc::clone(&slots);
            let client = Arc::clone(&client);
            let params = Arc::clone(&params);
            let index = files.index;
            let handle = tokio::spawn(async move {
                let _permit = slots
                    .acquire_owned()
                    .await
                    .map_err(|e| AppError::InternalError(format!("worker pool closed: {e}")))?;
                process_chunk(&files, &client, &params).await
            });
            (index, handle)
        })
        .collect();

    let mut report = PoolReport::default();
    for (index, handle) in handles {
        let outcome = match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(AppError::Join(join_err)),
        };
        match outcome {
            Ok(chunk_report) => report.completed.push(chunk_report),
            Err(err) => {
                error!(chunk = index, error = %err, "chunk worker failed; re-run to resume it");
                report.failed.push(ChunkFailure {
                    index,
                    error: err.to_string(),
                });
            }
        }
    }

    report
}

/// Logs answered/total rows across `chunks` every `interval` until aborted.
pub fn spawn_progress_monitor(chunks: Vec<ChunkFiles>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        if interval.is_zero() {
            return;
        }
        let total = match total_rows(&chunks).await {
            Ok(total) => total,
            Err(err) => {
                error!(error = %err, "progress monitor could not size the batch");
                return;
            }
        };

        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let answered = answered_rows(&chunks).await;
            info!(answered, total, "batch progress");
        }
    })
}

/// Progress rows across `chunks`; an unreadable progress file counts as none.
async fn answered_rows(chunks: &[ChunkFiles]) -> usize {
    let mut answered = 0_usize;
    for files in chunks {
        match rows::count_rows(&files.progress).await {
            Ok(count) => answered = answered.saturating_add(count),
            Err(err) => debug!(
                chunk = files.index,
                error = %err,
                "progress file not readable"
            ),
        }
    }
    answered
}

async fn total_rows(chunks: &[ChunkFiles]) -> Result<usize, AppError> {
    let mut total = 0_usize;
    for files in chunks {
        total = total.saturating_add(rows::count_rows(&files.source).await?);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        cache::create_chunk_splits,
        pipeline::{
            config::RetryPolicy,
            inference::tests::answer_params,
            services::{ChatReply, ChatRequest, CompletionService},
        },
        types::{PromptSet, SystemPrompts},
        utils::truncation::{PromptTruncator, DEFAULT_PROMPT_TOKEN_LIMIT},
    };

    /// Answers everything, tracking how many calls overlap. Prompts equal to
    /// `poison` make the service panic.
    struct ConcurrencyProbe {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        poison: Option<String>,
    }

    impl ConcurrencyProbe {
        fn new(poison: Option<&str>) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                poison: poison.map(str::to_owned),
            }
        }
    }

    #[async_trait]
    impl CompletionService for ConcurrencyProbe {
        async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, AppError> {
            let prompt = &request.messages[0].content;
            if self.poison.as_deref() == Some(prompt.as_str()) {
                panic!("poisoned prompt");
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ChatReply {
                content: "My answer: A Reason: probe".into(),
                system_fingerprint: None,
            })
        }
    }

    async fn batch_chunks(dir: &std::path::Path, prompts: usize, chunks: usize) -> Vec<ChunkFiles> {
        let set = PromptSet::new(
            (0..prompts).map(|i| format!("Q{i}")).collect(),
            SystemPrompts::None,
        )
        .unwrap();
        create_chunk_splits(&set, chunks, dir)
            .await
            .unwrap()
            .chunks()
            .await
            .unwrap()
    }

    fn client(service: Arc<ConcurrencyProbe>) -> Arc<InferenceClient> {
        Arc::new(InferenceClient::new(
            service,
            Arc::new(PromptTruncator::new(DEFAULT_PROMPT_TOKEN_LIMIT).unwrap()),
            RetryPolicy::immediate(),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallelism_caps_concurrent_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = batch_chunks(dir.path(), 12, 6).await;
        let probe = Arc::new(ConcurrencyProbe::new(None));

        let report = run_chunks(&chunks, 2, client(probe.clone()), Arc::new(answer_params())).await;

        assert!(report.all_succeeded());
        assert_eq!(report.completed.len(), 6);
        assert!(probe.peak.load(Ordering::SeqCst) <= 2);
        for files in &chunks {
            assert_eq!(rows::count_rows(&files.progress).await.unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn answered_rows_skips_unreadable_progress() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = batch_chunks(dir.path(), 4, 2).await;
        rows::append_row(&chunks[0].progress, &serde_json::json!({"prompt": "Q0"}))
            .await
            .unwrap();
        tokio::fs::create_dir(&chunks[1].progress).await.unwrap();

        assert_eq!(answered_rows(&chunks).await, 1);
        assert_eq!(total_rows(&chunks).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn a_crashing_chunk_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = batch_chunks(dir.path(), 4, 2).await;
        let probe = Arc::new(ConcurrencyProbe::new(Some("Q3")));

        let report = run_chunks(&chunks, 2, client(probe), Arc::new(answer_params())).await;

        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.completed[0].index, 0);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].index, 1);
        // Q2 was answered before the worker died on Q3.
        assert_eq!(rows::count_rows(&chunks[1].progress).await.unwrap(), 1);
    }
}
