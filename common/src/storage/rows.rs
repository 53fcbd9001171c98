//! JSON-lines row files.
//!
//! Every row is one serialized JSON object terminated by `\n`. Appends are
//! synced to disk before returning, so a crash can lose at most the row that
//! was being written, which then shows up as an unterminated tail line.

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

use crate::error::AppError;

/// Result of scanning a row file that may end in a torn write.
#[derive(Debug)]
pub struct RowScan<T> {
    pub rows: Vec<T>,
    /// Byte length of the newline-terminated prefix holding `rows`.
    pub complete_len: u64,
    /// True when bytes after the last newline were dropped.
    pub torn_tail: bool,
}

pub async fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, AppError> {
    let scan = scan_rows(path).await?;
    if scan.torn_tail {
        return Err(AppError::CorruptRows {
            path: path.to_path_buf(),
            reason: "file ends with an unterminated row".into(),
        });
    }
    Ok(scan.rows)
}

/// Reads every newline-terminated row and reports a trailing partial line
/// instead of failing on it.
pub async fn scan_rows<T: DeserializeOwned>(path: &Path) -> Result<RowScan<T>, AppError> {
    let raw = fs::read(path).await?;
    let complete_len = raw
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |pos| pos.saturating_add(1));
    let (complete, tail) = raw.split_at(complete_len);

    let mut rows = Vec::new();
    for (line_no, line) in complete.split(|byte| *byte == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let row = serde_json::from_slice(line).map_err(|e| AppError::CorruptRows {
            path: path.to_path_buf(),
            reason: format!("line {}: {e}", line_no.saturating_add(1)),
        })?;
        rows.push(row);
    }

    Ok(RowScan {
        rows,
        complete_len: u64::try_from(complete_len).unwrap_or(u64::MAX),
        torn_tail: !tail.iter().all(u8::is_ascii_whitespace),
    })
}

/// Cuts a row file back to `len` bytes, dropping a torn tail.
pub async fn truncate_rows(path: &Path, len: u64) -> Result<(), AppError> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    file.sync_all().await?;
    Ok(())
}

/// Replaces `path` with `rows`, going through a temporary file so readers
/// never observe a half-written file.
pub async fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), AppError> {
    let mut body = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut body, row)?;
        body.push(b'\n');
    }
    write_atomically(path, &body).await
}

/// Writes `rows` as one pretty-printed JSON array.
pub async fn write_json_array<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), AppError> {
    let body = serde_json::to_vec_pretty(rows)?;
    write_atomically(path, &body).await
}

pub async fn append_row<T: Serialize>(path: &Path, row: &T) -> Result<(), AppError> {
    let mut line = serde_json::to_vec(row)?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

/// Counts newline-terminated rows without deserializing them. A missing file
/// counts as zero.
pub async fn count_rows(path: &Path) -> Result<usize, AppError> {
    match fs::read(path).await {
        Ok(raw) => Ok(raw.iter().filter(|byte| **byte == b'\n').count()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

async fn write_atomically(path: &Path, body: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".partial");
    let tmp_path = std::path::PathBuf::from(tmp_name);

    fs::write(&tmp_path, body).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}
