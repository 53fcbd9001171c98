use std::{
    io::{BufRead, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::Local;
use common::error::AppError;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{
    batch::{create_chunk_splits, CacheBatch},
    identity::matches,
};
use crate::types::PromptSet;

pub const DEFAULT_SELECTION_TIMEOUT: Duration = Duration::from_secs(60);
const BATCH_NAME_FORMAT: &str = "%Y-%m-%d %H_%M_%S";

/// How to pick between resuming a matching cache batch and starting fresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachePolicy {
    /// Ask on the console, defaulting to a fresh batch after `timeout`.
    Interactive { timeout: Duration },
    /// Never resume.
    Fresh,
    /// Resume the most recently named matching batch, if any.
    ResumeLatest,
    /// Resume the batch with this directory name; it must match.
    ResumeNamed(String),
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::Interactive {
            timeout: DEFAULT_SELECTION_TIMEOUT,
        }
    }
}

/// Operator answer to the numbered cache prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Resume(usize),
    Fresh,
    Invalid,
}

pub fn parse_selection(input: &str, candidates: usize) -> Selection {
    let answer = input.trim();
    if answer.eq_ignore_ascii_case("n") {
        return Selection::Fresh;
    }
    if answer.is_empty() || !answer.bytes().all(|b| b.is_ascii_digit()) {
        return Selection::Invalid;
    }
    match answer.parse::<usize>() {
        Ok(idx) if idx < candidates => Selection::Resume(idx),
        _ => Selection::Invalid,
    }
}

/// Subdirectories of `cache_root` whose identity matches `prompt_set`,
/// ordered by name.
pub async fn find_matching_batches(
    cache_root: &Path,
    prompt_set: &PromptSet,
) -> Result<Vec<CacheBatch>, AppError> {
    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(cache_root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();

    let mut matching = Vec::new();
    for dir in dirs {
        if matches(&dir, prompt_set).await {
            matching.push(CacheBatch::open(dir));
        }
    }
    Ok(matching)
}

/// Resolves the cache batch for this run: resumes a matching batch when the
/// policy says so, otherwise splits `prompt_set` into a new timestamped batch.
pub async fn select_or_create(
    prompt_set: &PromptSet,
    cache_root: &Path,
    chunk_count: usize,
    policy: &CachePolicy,
) -> Result<CacheBatch, AppError> {
    select_or_create_with(
        prompt_set,
        cache_root,
        chunk_count,
        policy,
        stdin_lines,
        &mut std::io::stdout(),
    )
    .await
}

/// [`select_or_create`] with the interactive answers read from whatever
/// `console` opens and the listing written to `out`.
async fn select_or_create_with<W: Write>(
    prompt_set: &PromptSet,
    cache_root: &Path,
    chunk_count: usize,
    policy: &CachePolicy,
    console: impl FnOnce() -> mpsc::UnboundedReceiver<String>,
    out: &mut W,
) -> Result<CacheBatch, AppError> {
    tokio::fs::create_dir_all(cache_root).await?;
    let candidates = find_matching_batches(cache_root, prompt_set).await?;

    let chosen = match policy {
        _ if candidates.is_empty() => {
            if let CachePolicy::ResumeNamed(name) = policy {
                return Err(AppError::NotFound(format!(
                    "cache batch {name} does not match the current prompts"
                )));
            }
            None
        }
        CachePolicy::Fresh => None,
        CachePolicy::ResumeLatest => candidates.last().cloned(),
        CachePolicy::ResumeNamed(name) => Some(
            candidates
                .iter()
                .find(|batch| batch.name() == *name)
                .cloned()
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "cache batch {name} does not match the current prompts"
                    ))
                })?,
        ),
        CachePolicy::Interactive { timeout } => {
            info!(usable = candidates.len(), "usable cache batches detected");
            let mut lines = console();
            let idx = choose_from_lines(&candidates, &mut lines, *timeout, out).await?;
            idx.and_then(|idx| candidates.get(idx).cloned())
        }
    };

    if let Some(batch) = chosen {
        info!(dir = %batch.dir().display(), "resuming cache batch");
        return Ok(batch);
    }

    let dir = fresh_batch_dir(cache_root).await?;
    info!(dir = %dir.display(), "generating new cache batch");
    create_chunk_splits(prompt_set, chunk_count, &dir).await
}

/// Timestamped directory name that does not clobber an existing batch.
async fn fresh_batch_dir(cache_root: &Path) -> Result<PathBuf, AppError> {
    let stamp = Local::now().format(BATCH_NAME_FORMAT).to_string();
    let mut candidate = cache_root.join(&stamp);
    let mut suffix = 1_u32;
    while tokio::fs::try_exists(&candidate).await? {
        candidate = cache_root.join(format!("{stamp}-{suffix}"));
        suffix = suffix.saturating_add(1);
    }
    Ok(candidate)
}

/// Lines typed on stdin, read on a plain thread: a blocked read must not hold
/// up runtime shutdown once the prompt has timed out.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Shows the numbered list and reads answers from `lines` until one is valid.
/// Timeout, a closed input, or a decline all mean "start fresh".
pub async fn choose_from_lines<W: Write>(
    candidates: &[CacheBatch],
    lines: &mut mpsc::UnboundedReceiver<String>,
    timeout: Duration,
    out: &mut W,
) -> Result<Option<usize>, AppError> {
    for (idx, batch) in candidates.iter().enumerate() {
        writeln!(out, "{idx}: {}", batch.name())?;
    }

    loop {
        writeln!(
            out,
            "Which cache do you want to read? Input the number, N for Do not read cache:"
        )?;
        out.flush()?;

        let answer = match tokio::time::timeout(timeout, lines.recv()).await {
            Ok(Some(answer)) => answer,
            Ok(None) => {
                warn!("console input closed; cache not read");
                return Ok(None);
            }
            Err(_) => {
                writeln!(out, "Input timeout, cache not read by default.")?;
                return Ok(None);
            }
        };

        match parse_selection(&answer, candidates.len()) {
            Selection::Resume(idx) => return Ok(Some(idx)),
            Selection::Fresh => return Ok(None),
            Selection::Invalid => {
                writeln!(out, "'{}' is not a listed cache number.", answer.trim())?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::batch::create_chunk_splits, types::SystemPrompts};

    fn prompt_set(prompts: &[&str], system: SystemPrompts) -> PromptSet {
        PromptSet::new(prompts.iter().map(|p| (*p).to_string()).collect(), system).unwrap()
    }

    #[test]
    fn parse_selection_handles_numbers_declines_and_garbage() {
        assert_eq!(parse_selection("0", 2), Selection::Resume(0));
        assert_eq!(parse_selection(" 1\n", 2), Selection::Resume(1));
        assert_eq!(parse_selection("N", 2), Selection::Fresh);
        assert_eq!(parse_selection("n", 2), Selection::Fresh);
        assert_eq!(parse_selection("2", 2), Selection::Invalid);
        assert_eq!(parse_selection("-1", 2), Selection::Invalid);
        assert_eq!(parse_selection("yes", 2), Selection::Invalid);
        assert_eq!(parse_selection("", 2), Selection::Invalid);
    }

    #[tokio::test]
    async fn invalid_answers_reprompt_until_a_valid_one() {
        let candidates = vec![CacheBatch::open("a"), CacheBatch::open("b")];
        let (tx, mut rx) = mpsc::unbounded_channel();
        for answer in ["7", "maybe", "1"] {
            tx.send(answer.to_string()).unwrap();
        }

        let mut out = Vec::new();
        let chosen = choose_from_lines(&candidates, &mut rx, Duration::from_secs(5), &mut out)
            .await
            .unwrap();

        assert_eq!(chosen, Some(1));
        let shown = String::from_utf8(out).unwrap();
        assert!(shown.contains("0: a"));
        assert!(shown.contains("1: b"));
        assert_eq!(shown.matches("Which cache").count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_to_fresh() {
        let candidates = vec![CacheBatch::open("a")];
        let (_tx, mut rx) = mpsc::unbounded_channel::<String>();

        let mut out = Vec::new();
        let chosen = choose_from_lines(&candidates, &mut rx, Duration::from_secs(60), &mut out)
            .await
            .unwrap();

        assert_eq!(chosen, None);
        assert!(String::from_utf8(out).unwrap().contains("Input timeout"));
    }

    #[tokio::test]
    async fn only_matching_batches_are_offered() {
        let root = tempfile::tempdir().unwrap();
        let wanted = prompt_set(&["Q1", "Q2"], SystemPrompts::None);
        let other_system = prompt_set(&["Q1", "Q2"], SystemPrompts::Shared("sys".into()));

        create_chunk_splits(&wanted, 2, &root.path().join("2024-01-01 00_00_00"))
            .await
            .unwrap();
        create_chunk_splits(&other_system, 2, &root.path().join("2024-01-02 00_00_00"))
            .await
            .unwrap();
        tokio::fs::create_dir(root.path().join("junk")).await.unwrap();
        tokio::fs::write(root.path().join("stray.txt"), b"x")
            .await
            .unwrap();

        let found = find_matching_batches(root.path(), &wanted).await.unwrap();
        let names: Vec<String> = found.iter().map(CacheBatch::name).collect();
        assert_eq!(names, vec!["2024-01-01 00_00_00"]);
    }

    #[tokio::test]
    async fn policies_resume_or_create() {
        let root = tempfile::tempdir().unwrap();
        let set = prompt_set(&["Q1", "Q2", "Q3"], SystemPrompts::None);

        let first = select_or_create(&set, root.path(), 2, &CachePolicy::ResumeLatest)
            .await
            .unwrap();
        assert_eq!(first.chunks().await.unwrap().len(), 2);

        let resumed = select_or_create(&set, root.path(), 2, &CachePolicy::ResumeLatest)
            .await
            .unwrap();
        assert_eq!(resumed, first);

        let named = select_or_create(&set, root.path(), 2, &CachePolicy::ResumeNamed(first.name()))
            .await
            .unwrap();
        assert_eq!(named, first);

        let fresh = select_or_create(&set, root.path(), 2, &CachePolicy::Fresh)
            .await
            .unwrap();
        assert_ne!(fresh, first);
        assert!(first.dir().exists());

        let missing =
            select_or_create(&set, root.path(), 2, &CachePolicy::ResumeNamed("nope".into())).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    fn scripted_console(
        answers: &'static [&'static str],
    ) -> impl FnOnce() -> mpsc::UnboundedReceiver<String> {
        move || {
            let (tx, rx) = mpsc::unbounded_channel();
            for answer in answers {
                tx.send((*answer).to_string()).unwrap();
            }
            rx
        }
    }

    #[tokio::test]
    async fn interactive_policy_follows_the_console_answer() {
        let root = tempfile::tempdir().unwrap();
        let set = prompt_set(&["Q1", "Q2"], SystemPrompts::None);
        let interactive = CachePolicy::Interactive {
            timeout: Duration::from_secs(5),
        };
        let first = select_or_create(&set, root.path(), 2, &CachePolicy::ResumeLatest)
            .await
            .unwrap();

        let mut out = Vec::new();
        let resumed = select_or_create_with(
            &set,
            root.path(),
            2,
            &interactive,
            scripted_console(&["9", "0"]),
            &mut out,
        )
        .await
        .unwrap();
        assert_eq!(resumed, first);
        let shown = String::from_utf8(out).unwrap();
        assert!(shown.contains(&format!("0: {}", first.name())));

        let declined = select_or_create_with(
            &set,
            root.path(),
            2,
            &interactive,
            scripted_console(&["n"]),
            &mut Vec::new(),
        )
        .await
        .unwrap();
        assert_ne!(declined, first);
        assert_eq!(declined.chunks().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn interactive_policy_skips_the_console_without_candidates() {
        let root = tempfile::tempdir().unwrap();
        let set = prompt_set(&["Q1"], SystemPrompts::None);
        let policy = CachePolicy::Interactive {
            timeout: Duration::from_secs(5),
        };

        let mut out = Vec::new();
        let batch = select_or_create_with(
            &set,
            root.path(),
            1,
            &policy,
            || panic!("console opened with nothing to offer"),
            &mut out,
        )
        .await
        .unwrap();

        assert!(out.is_empty());
        assert_eq!(batch.chunks().await.unwrap().len(), 1);
    }
}
