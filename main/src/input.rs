use std::path::Path;

use anyhow::{Context, Result};

/// Reads a list of texts from `path`: a JSON array of strings when the file
/// starts with `[`, otherwise one entry per non-blank line.
pub async fn load_texts(path: &Path) -> Result<Vec<String>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_texts(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn parse_texts(raw: &str) -> Result<Vec<String>> {
    if raw.trim_start().starts_with('[') {
        return serde_json::from_str(raw).context("expected a JSON array of strings");
    }
    Ok(raw
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_owned)
        .collect())
}
