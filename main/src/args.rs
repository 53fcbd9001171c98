use std::{path::PathBuf, time::Duration};

use clap::{ArgGroup, Args, Parser, Subcommand};
use inference_pipeline::{
    pipeline::DEFAULT_SEEDS, utils::truncation::DEFAULT_PROMPT_TOKEN_LIMIT, CachePolicy,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable parallel batch inference", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Answer every prompt of a prompt file, resuming cached progress
    Run(RunArgs),
    /// Show per-chunk progress of the batches in a cache directory
    Status(StatusArgs),
    /// Merge a finished cache batch into an output file
    Merge(MergeArgs),
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("cache_policy").args(["fresh", "resume", "resume_latest"])))]
pub struct RunArgs {
    /// Prompt file: a JSON array of strings or one prompt per line
    pub prompts: PathBuf,

    /// Model name sent with every request
    #[arg(long)]
    pub model: String,

    /// Regex applied to each answer; its capture groups become the result
    #[arg(long)]
    pub pattern: String,

    /// System prompt shared by every prompt
    #[arg(long, conflicts_with = "system_prompts_file")]
    pub system_prompt: Option<String>,

    /// One system prompt per prompt, same format as the prompt file
    #[arg(long)]
    pub system_prompts_file: Option<PathBuf>,

    /// Write merged rows here (`.json` for an array, JSON lines otherwise)
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    #[arg(long, default_value_t = 1.0)]
    pub temperature: f32,

    #[arg(long, default_value_t = 1.0)]
    pub top_p: f32,

    #[arg(long, default_value_t = 1024)]
    pub max_tokens: u32,

    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_SEEDS)]
    pub seeds: Vec<i64>,

    /// Which of `--seeds` to send
    #[arg(long, default_value_t = 0)]
    pub seed_index: usize,

    /// Concurrent chunk workers, also the number of chunks of a fresh batch
    #[arg(long)]
    pub parallel: Option<usize>,

    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    #[arg(long)]
    pub service_url: Option<String>,

    /// Always start a fresh cache batch
    #[arg(long)]
    pub fresh: bool,

    /// Resume the named cache batch
    #[arg(long, value_name = "BATCH")]
    pub resume: Option<String>,

    /// Resume the newest matching cache batch without asking
    #[arg(long)]
    pub resume_latest: bool,

    /// Seconds to wait for a console answer before starting fresh
    #[arg(long)]
    pub selection_timeout: Option<u64>,

    /// Give up on a prompt after this many service errors (default: never)
    #[arg(long)]
    pub max_service_retries: Option<u32>,

    /// Retries before an unparsable answer is recorded as null
    #[arg(long, default_value_t = 5)]
    pub max_parse_retries: u32,

    /// Prompts longer than this many tokens are truncated
    #[arg(long, default_value_t = DEFAULT_PROMPT_TOKEN_LIMIT)]
    pub prompt_token_limit: usize,
}

impl RunArgs {
    pub fn cache_policy(&self, default_timeout_secs: u64) -> CachePolicy {
        if self.fresh {
            CachePolicy::Fresh
        } else if let Some(name) = &self.resume {
            CachePolicy::ResumeNamed(name.clone())
        } else if self.resume_latest {
            CachePolicy::ResumeLatest
        } else {
            CachePolicy::Interactive {
                timeout: Duration::from_secs(
                    self.selection_timeout.unwrap_or(default_timeout_secs),
                ),
            }
        }
    }
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Defaults to the configured cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Cache batch directory
    pub batch: PathBuf,

    #[arg(long, short)]
    pub output: PathBuf,
}
