use common::{
    error::AppError,
    storage::rows::{self, RowScan},
};
use tracing::{info, warn};

use super::{config::InferenceParams, inference::InferenceClient};
use crate::{
    cache::ChunkFiles,
    types::{ProgressRow, PromptRow},
};

/// What one worker did with its chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReport {
    pub index: usize,
    pub total: usize,
    /// Rows already answered before this run started.
    pub resumed_from: usize,
    /// Rows answered by this run.
    pub answered: usize,
    pub parse_failures: usize,
}

/// Answers every row of one chunk that has no progress row yet.
///
/// Each answered row is appended and synced to the progress file before the
/// next prompt is sent, so an interrupted run loses at most the row in
/// flight.
#[tracing::instrument(skip_all, fields(chunk = files.index))]
pub async fn process_chunk(
    files: &ChunkFiles,
    client: &InferenceClient,
    params: &InferenceParams,
) -> Result<ChunkReport, AppError> {
    let source: Vec<PromptRow> = rows::read_rows(&files.source).await?;
    let done = completed_rows(files, &source).await?;

    let mut report = ChunkReport {
        index: files.index,
        total: source.len(),
        resumed_from: done,
        answered: 0,
        parse_failures: 0,
    };

    let remaining = source.len().saturating_sub(done);
    if remaining == 0 {
        info!(total = source.len(), "chunk already complete");
        return Ok(report);
    }
    info!(total = source.len(), done, remaining, "processing chunk");

    for row in source.iter().skip(done) {
        let outcome = client
            .infer(&row.prompt, row.system_prompt.as_deref(), params)
            .await?;
        if !outcome.is_parsed() {
            report.parse_failures = report.parse_failures.saturating_add(1);
        }

        let progress = ProgressRow {
            row: row.clone(),
            llm_response: outcome,
        };
        rows::append_row(&files.progress, &progress).await?;
        report.answered = report.answered.saturating_add(1);
    }

    info!(
        answered = report.answered,
        parse_failures = report.parse_failures,
        "chunk finished"
    );
    Ok(report)
}

/// Number of leading chunk rows that already have progress rows.
///
/// A torn final line left by a crash is cut off. Progress that disagrees with
/// the chunk is refused rather than resumed.
async fn completed_rows(files: &ChunkFiles, source: &[PromptRow]) -> Result<usize, AppError> {
    if !tokio::fs::try_exists(&files.progress).await? {
        return Ok(0);
    }

    let scan: RowScan<ProgressRow> = rows::scan_rows(&files.progress).await?;
    if scan.torn_tail {
        warn!(
            path = %files.progress.display(),
            kept_rows = scan.rows.len(),
            "dropping partially written progress row"
        );
        rows::truncate_rows(&files.progress, scan.complete_len).await?;
    }

    if scan.rows.len() > source.len() {
        return Err(AppError::CorruptRows {
            path: files.progress.clone(),
            reason: format!(
                "{} progress rows for a chunk of {} rows",
                scan.rows.len(),
                source.len()
            ),
        });
    }

    if let Some(position) = scan
        .rows
        .iter()
        .zip(source)
        .position(|(done, expected)| done.row != *expected)
    {
        return Err(AppError::CorruptRows {
            path: files.progress.clone(),
            reason: format!("progress row {position} does not match its chunk row"),
        });
    }

    Ok(scan.rows.len())
}
