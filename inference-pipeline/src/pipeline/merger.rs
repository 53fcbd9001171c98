use std::path::Path;

use common::{error::AppError, storage::rows};
use tracing::info;

use crate::{
    cache::{CacheBatch, ChunkFiles},
    types::{InferenceOutcome, ProgressRow, PromptRow},
};

/// Concatenates the progress rows of `chunks` in chunk-index order, optionally
/// saves them to `output_path`, and returns the answers in prompt order.
///
/// Every chunk must be fully answered; a short progress file is an
/// [`AppError::IncompleteChunk`].
pub async fn merge_results(
    chunks: &[ChunkFiles],
    output_path: Option<&Path>,
) -> Result<Vec<InferenceOutcome>, AppError> {
    let mut ordered: Vec<&ChunkFiles> = chunks.iter().collect();
    ordered.sort_by_key(|files| files.index);

    let mut merged: Vec<ProgressRow> = Vec::new();
    for files in ordered {
        let source: Vec<PromptRow> = rows::read_rows(&files.source).await?;
        let progress: Vec<ProgressRow> = if tokio::fs::try_exists(&files.progress).await? {
            rows::read_rows(&files.progress).await?
        } else {
            Vec::new()
        };

        if progress.len() != source.len() {
            return Err(AppError::IncompleteChunk {
                index: files.index,
                completed: progress.len(),
                expected: source.len(),
            });
        }
        merged.extend(progress);
    }

    if let Some(path) = output_path {
        save_rows(path, &merged).await?;
        info!(rows = merged.len(), path = %path.display(), "saved merged results");
    }

    info!(rows = merged.len(), "merged results");
    Ok(merged.into_iter().map(|row| row.llm_response).collect())
}

pub async fn merge_batch(
    batch: &CacheBatch,
    output_path: Option<&Path>,
) -> Result<Vec<InferenceOutcome>, AppError> {
    let chunks = batch.verified_chunks().await?;
    merge_results(&chunks, output_path).await
}

/// `.json` outputs get one JSON array; anything else gets JSON lines.
async fn save_rows(path: &Path, merged: &[ProgressRow]) -> Result<(), AppError> {
    let is_json_array = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json_array {
        rows::write_json_array(path, merged).await
    } else {
        rows::write_rows(path, merged).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::create_chunk_splits,
        types::{PromptSet, SystemPrompts},
    };

    fn answer_for(prompt: &str) -> ProgressRow {
        ProgressRow {
            row: PromptRow {
                prompt: prompt.into(),
                system_prompt: None,
            },
            llm_response: InferenceOutcome::Parsed(vec![format!("r({prompt})")]),
        }
    }

    async fn answered_batch(dir: &Path, prompts: usize, chunks: usize) -> CacheBatch {
        let set = PromptSet::new(
            (0..prompts).map(|i| format!("Q{i}")).collect(),
            SystemPrompts::None,
        )
        .unwrap();
        let batch = create_chunk_splits(&set, chunks, dir).await.unwrap();
        for files in batch.chunks().await.unwrap() {
            let source: Vec<PromptRow> = rows::read_rows(&files.source).await.unwrap();
            for row in source {
                rows::append_row(&files.progress, &answer_for(&row.prompt))
                    .await
                    .unwrap();
            }
        }
        batch
    }

    fn expected(prompts: usize) -> Vec<InferenceOutcome> {
        (0..prompts)
            .map(|i| InferenceOutcome::Parsed(vec![format!("r(Q{i})")]))
            .collect()
    }

    #[tokio::test]
    async fn eleven_chunks_merge_in_numeric_order() {
        let dir = tempfile::tempdir().unwrap();
        let batch = answered_batch(dir.path(), 11, 11).await;

        let merged = merge_batch(&batch, None).await.unwrap();
        assert_eq!(merged, expected(11));
    }

    #[tokio::test]
    async fn merge_ignores_the_order_chunks_are_passed_in() {
        let dir = tempfile::tempdir().unwrap();
        let batch = answered_batch(dir.path(), 4, 2).await;
        let mut chunks = batch.chunks().await.unwrap();
        chunks.reverse();

        assert_eq!(merge_results(&chunks, None).await.unwrap(), expected(4));
    }

    #[tokio::test]
    async fn merging_a_batch_with_a_lost_chunk_fails() {
        let dir = tempfile::tempdir().unwrap();
        let batch = answered_batch(dir.path(), 4, 2).await;
        tokio::fs::remove_file(dir.path().join("1.jsonl"))
            .await
            .unwrap();

        let err = merge_batch(&batch, None).await.unwrap_err();
        assert!(matches!(err, AppError::CorruptRows { .. }), "{err}");
    }

    #[tokio::test]
    async fn incomplete_chunk_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let set = PromptSet::new(
            vec!["Q0".into(), "Q1".into(), "Q2".into(), "Q3".into()],
            SystemPrompts::None,
        )
        .unwrap();
        let batch = create_chunk_splits(&set, 2, dir.path()).await.unwrap();
        let chunks = batch.chunks().await.unwrap();
        rows::append_row(&chunks[0].progress, &answer_for("Q0"))
            .await
            .unwrap();
        rows::append_row(&chunks[0].progress, &answer_for("Q1"))
            .await
            .unwrap();
        rows::append_row(&chunks[1].progress, &answer_for("Q2"))
            .await
            .unwrap();

        let err = merge_results(&chunks, None).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::IncompleteChunk {
                index: 1,
                completed: 1,
                expected: 2
            }
        ));
    }

    #[tokio::test]
    async fn output_file_holds_all_rows() {
        let dir = tempfile::tempdir().unwrap();
        let batch = answered_batch(&dir.path().join("batch"), 3, 2).await;

        let lines_path = dir.path().join("out.jsonl");
        merge_batch(&batch, Some(&lines_path)).await.unwrap();
        let saved: Vec<ProgressRow> = rows::read_rows(&lines_path).await.unwrap();
        assert_eq!(saved, vec![answer_for("Q0"), answer_for("Q1"), answer_for("Q2")]);

        let array_path = dir.path().join("out.json");
        merge_batch(&batch, Some(&array_path)).await.unwrap();
        let raw = tokio::fs::read(&array_path).await.unwrap();
        let saved: Vec<ProgressRow> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(saved.len(), 3);
        assert_eq!(saved[2].llm_response, InferenceOutcome::Parsed(vec!["r(Q2)".into()]));
    }
}
