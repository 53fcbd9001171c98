mod args;
mod input;

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use common::utils::config::{get_cache_dir, get_config};
use inference_pipeline::{
    cache::{list_batches, CacheIdentity},
    pipeline::merge_batch,
    utils::pattern::ResponsePattern,
    BatchPipeline, BatchRequest, CacheBatch, InferenceOutcome, InferenceParams, InferenceTuning,
    RetryPolicy, SystemPrompts,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::{Cli, Command, MergeArgs, RunArgs, StatusArgs};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .ok();

    match Cli::parse().command {
        Command::Run(args) => run(args).await,
        Command::Status(args) => status(args).await,
        Command::Merge(args) => merge(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = get_config().context("loading configuration (is API_KEY set?)")?;
    if let Some(url) = &args.service_url {
        config.service_url.clone_from(url);
    }

    let prompts = input::load_texts(&args.prompts).await?;
    let system_prompts = match (&args.system_prompt, &args.system_prompts_file) {
        (Some(shared), _) => SystemPrompts::Shared(shared.clone()),
        (None, Some(path)) => SystemPrompts::PerPrompt(input::load_texts(path).await?),
        (None, None) => SystemPrompts::None,
    };

    let pattern = ResponsePattern::new(&args.pattern)
        .with_context(|| format!("compiling pattern {}", args.pattern))?;
    let mut params = InferenceParams::new(args.model.clone(), pattern);
    params.temperature = args.temperature;
    params.top_p = args.top_p;
    params.max_tokens = args.max_tokens;
    params.seeds.clone_from(&args.seeds);
    params.seed_index = args.seed_index;

    let mut request = BatchRequest::new(prompts, params);
    request.system_prompts = system_prompts;
    request.output_path.clone_from(&args.output);
    request.parallelism = args.parallel.unwrap_or(config.parallelism);
    request.cache_dir = args
        .cache_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.cache_dir));
    request.cache_policy = args.cache_policy(config.selection_timeout_secs);

    let tuning = InferenceTuning {
        retry: RetryPolicy {
            max_parse_retries: args.max_parse_retries,
            max_service_retries: args.max_service_retries,
            ..RetryPolicy::default()
        },
        prompt_token_limit: args.prompt_token_limit,
        progress_interval: Duration::from_secs(config.progress_interval_secs),
        ..InferenceTuning::default()
    };

    let pipeline = BatchPipeline::new(&config, tuning).context("building inference pipeline")?;
    let answers = pipeline.run(request).await.context("running batch")?;

    if args.output.is_none() {
        print_answers(&answers)?;
    }
    info!(
        answers = answers.len(),
        parsed = answers.iter().filter(|a| a.is_parsed()).count(),
        "done"
    );
    Ok(())
}

fn print_answers(answers: &[InferenceOutcome]) -> Result<()> {
    for answer in answers {
        println!("{}", serde_json::to_string(answer)?);
    }
    Ok(())
}

async fn status(args: StatusArgs) -> Result<()> {
    let cache_dir = match args.cache_dir {
        Some(dir) => dir,
        None => PathBuf::from(get_cache_dir().context("loading configuration")?),
    };
    let batches = list_batches(&cache_dir)
        .await
        .with_context(|| format!("listing cache batches in {}", cache_dir.display()))?;
    if batches.is_empty() {
        println!("no cache batches in {}", cache_dir.display());
        return Ok(());
    }

    for batch in batches {
        let identity = CacheIdentity::load(batch.dir()).await?;
        let progress = batch
            .progress()
            .await
            .with_context(|| format!("reading progress of {}", batch.name()))?;
        let answered: usize = progress.iter().map(|c| c.answered).sum();
        let total: usize = progress.iter().map(|c| c.total).sum();

        println!("{}  {answered}/{total}", batch.name());
        if let Some(identity) = identity {
            println!("  prompts hash {}", identity.prompts_hash);
        }
        for chunk in progress {
            let mark = if chunk.is_complete() { "done" } else { "open" };
            println!(
                "  chunk {:>3}  {:>6}/{:<6} {mark}",
                chunk.index, chunk.answered, chunk.total
            );
        }
    }
    Ok(())
}

async fn merge(args: MergeArgs) -> Result<()> {
    let batch = CacheBatch::open(&args.batch);
    let answers = merge_batch(&batch, Some(&args.output))
        .await
        .with_context(|| format!("merging {}", args.batch.display()))?;
    println!("wrote {} rows to {}", answers.len(), args.output.display());
    Ok(())
}
