use std::path::{Path, PathBuf};

use common::{error::AppError, storage::rows};
use tracing::info;

use super::identity::{CacheIdentity, IDENTITY_FILE_NAME};
use crate::types::PromptSet;

const CHUNK_EXTENSION: &str = "jsonl";
const PROGRESS_SUFFIX: &str = ".tmp.jsonl";

/// The pair of files owned by one chunk worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFiles {
    pub index: usize,
    /// Immutable rows to answer.
    pub source: PathBuf,
    /// Append-only answered rows.
    pub progress: PathBuf,
}

impl ChunkFiles {
    fn new(dir: &Path, index: usize) -> Self {
        Self {
            index,
            source: dir.join(format!("{index}.{CHUNK_EXTENSION}")),
            progress: dir.join(format!("{index}{PROGRESS_SUFFIX}")),
        }
    }
}

/// A cache batch directory: the identity record plus numbered chunk files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheBatch {
    dir: PathBuf,
}

impl CacheBatch {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Chunk files present in the batch, in numeric index order so that chunk
    /// `2` precedes chunk `10`.
    pub async fn chunks(&self) -> Result<Vec<ChunkFiles>, AppError> {
        let mut indices = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(index) = chunk_index(&name.to_string_lossy()) {
                indices.push(index);
            }
        }
        indices.sort_unstable();

        if indices.is_empty() {
            return Err(AppError::NotFound(format!(
                "no chunk files in cache batch {}",
                self.dir.display()
            )));
        }

        Ok(indices
            .into_iter()
            .map(|index| ChunkFiles::new(&self.dir, index))
            .collect())
    }

    /// Chunk files checked against the identity record: indices run
    /// `0..chunk_count` without gaps and the chunks hold `prompt_count` rows
    /// between them. A batch that lost a chunk file is refused.
    pub async fn verified_chunks(&self) -> Result<Vec<ChunkFiles>, AppError> {
        let chunks = self.chunks().await?;
        let identity = CacheIdentity::load(&self.dir)
            .await?
            .ok_or_else(|| self.corrupt(format!("{IDENTITY_FILE_NAME} is missing")))?;

        if let Some(gap) = chunks
            .iter()
            .enumerate()
            .position(|(position, files)| files.index != position)
        {
            return Err(self.corrupt(format!(
                "chunk file {gap}.{CHUNK_EXTENSION} is missing"
            )));
        }
        if let Some(expected) = identity.chunk_count {
            if chunks.len() != expected {
                return Err(self.corrupt(format!(
                    "found {} of {expected} chunk files",
                    chunks.len()
                )));
            }
        }
        if let Some(expected) = identity.prompt_count {
            let mut prompts = 0_usize;
            for files in &chunks {
                prompts = prompts.saturating_add(rows::count_rows(&files.source).await?);
            }
            if prompts != expected {
                return Err(self.corrupt(format!(
                    "chunks hold {prompts} prompts, expected {expected}"
                )));
            }
        }
        Ok(chunks)
    }

    fn corrupt(&self, reason: String) -> AppError {
        AppError::CorruptRows {
            path: self.dir.clone(),
            reason,
        }
    }

    /// Answered versus total rows for every chunk of the batch.
    pub async fn progress(&self) -> Result<Vec<ChunkProgress>, AppError> {
        let mut out = Vec::new();
        for files in self.chunks().await? {
            out.push(ChunkProgress {
                index: files.index,
                answered: rows::count_rows(&files.progress).await?,
                total: rows::count_rows(&files.source).await?,
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub index: usize,
    pub answered: usize,
    pub total: usize,
}

impl ChunkProgress {
    pub fn is_complete(&self) -> bool {
        self.answered >= self.total
    }
}

/// Every batch directory under `cache_root` that carries an identity record,
/// ordered by name.
pub async fn list_batches(cache_root: &Path) -> Result<Vec<CacheBatch>, AppError> {
    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(cache_root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir()
            && CacheIdentity::load(&entry.path()).await?.is_some()
        {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs.into_iter().map(CacheBatch::open).collect())
}

/// Parses `"<n>.jsonl"` into `n`; progress files and anything else are
/// rejected.
fn chunk_index(file_name: &str) -> Option<usize> {
    if file_name.ends_with(PROGRESS_SUFFIX) {
        return None;
    }
    let stem = file_name.strip_suffix(CHUNK_EXTENSION)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Splits `prompt_set` into at most `chunk_count` contiguous chunks under
/// `dir` and tags the directory with the set's identity.
///
/// An existing `dir` is removed first; stale chunks are never merged with new
/// ones.
pub async fn create_chunk_splits(
    prompt_set: &PromptSet,
    chunk_count: usize,
    dir: &Path,
) -> Result<CacheBatch, AppError> {
    if prompt_set.is_empty() {
        return Err(AppError::Validation(
            "cannot split an empty prompt set".into(),
        ));
    }
    if chunk_count == 0 {
        return Err(AppError::Validation(
            "chunk count must be at least 1".into(),
        ));
    }

    if tokio::fs::try_exists(dir).await? {
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await?;

    let rows = prompt_set.rows();
    let chunk_count = chunk_count.min(rows.len());
    let per_chunk = rows.len().div_ceil(chunk_count);

    let mut written = 0;
    for (index, chunk_rows) in rows.chunks(per_chunk).enumerate() {
        let files = ChunkFiles::new(dir, index);
        rows::write_rows(&files.source, chunk_rows).await?;
        written = index.saturating_add(1);
    }

    let mut identity = CacheIdentity::for_prompt_set(prompt_set);
    identity.chunk_count = Some(written);
    identity.store(dir).await?;

    info!(
        dir = %dir.display(),
        prompts = rows.len(),
        chunks = written,
        per_chunk,
        "created cache batch"
    );

    Ok(CacheBatch::open(dir))
}
