use std::{path::PathBuf, sync::Arc, time::Duration};

use common::{error::AppError, utils::config::DEFAULT_SERVICE_URL};

use crate::{
    cache::CachePolicy,
    types::SystemPrompts,
    utils::{pattern::ResponsePattern, truncation::DEFAULT_PROMPT_TOKEN_LIMIT},
};

pub const DEFAULT_SEEDS: [i64; 5] = [42, 43, 44, 45, 46];

/// Retry budgets for the two failure classes of a single inference call.
///
/// The counters are independent: service outages never eat into the parse
/// budget and vice versa.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Parse retries before the call settles on a null answer.
    pub max_parse_retries: u32,
    /// Service retries before the call gives up with an error. `None` retries
    /// forever.
    pub max_service_retries: Option<u32>,
    pub base_delay: Duration,
    pub backoff_cap_exponent: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_parse_retries: 5,
            max_service_retries: None,
            base_delay: Duration::from_secs(1),
            backoff_cap_exponent: 10,
            max_delay: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `failures` failures of one class:
    /// `base * 2^failures`, with the exponent and the total both capped.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.min(self.backoff_cap_exponent);
        let multiplier = 2_u32.saturating_pow(exponent);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// No waiting between attempts; for tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct InferenceTuning {
    pub retry: RetryPolicy,
    pub prompt_token_limit: usize,
    pub request_timeout: Duration,
    pub progress_interval: Duration,
}

impl Default for InferenceTuning {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            prompt_token_limit: DEFAULT_PROMPT_TOKEN_LIMIT,
            request_timeout: Duration::from_secs(10 * 60),
            progress_interval: Duration::from_secs(30),
        }
    }
}

/// Per-request sampling parameters shared by every prompt of a batch.
#[derive(Debug, Clone)]
pub struct InferenceParams {
    pub model: String,
    pub pattern: Arc<ResponsePattern>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub seeds: Vec<i64>,
    pub seed_index: usize,
}

impl InferenceParams {
    pub fn new(model: impl Into<String>, pattern: ResponsePattern) -> Self {
        Self {
            model: model.into(),
            pattern: Arc::new(pattern),
            temperature: 1.0,
            top_p: 1.0,
            max_tokens: 1024,
            seeds: DEFAULT_SEEDS.to_vec(),
            seed_index: 0,
        }
    }

    pub fn seed(&self) -> Result<i64, AppError> {
        self.seeds.get(self.seed_index).copied().ok_or_else(|| {
            AppError::Validation(format!(
                "seed index {} is out of range for {} seeds",
                self.seed_index,
                self.seeds.len()
            ))
        })
    }
}

/// Everything a batch run needs besides the completion service itself.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub prompts: Vec<String>,
    pub system_prompts: SystemPrompts,
    pub params: InferenceParams,
    pub output_path: Option<PathBuf>,
    pub parallelism: usize,
    pub cache_dir: PathBuf,
    pub cache_policy: CachePolicy,
}

impl BatchRequest {
    pub fn new(prompts: Vec<String>, params: InferenceParams) -> Self {
        Self {
            prompts,
            system_prompts: SystemPrompts::None,
            params,
            output_path: None,
            parallelism: 10,
            cache_dir: PathBuf::from(".cache"),
            cache_policy: CachePolicy::default(),
        }
    }
}

/// Where and how to reach the completion service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service_url: String,
    pub api_key: String,
}

impl ServiceConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            api_key: api_key.into(),
        }
    }
}
