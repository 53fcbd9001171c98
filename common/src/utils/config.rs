use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub const DEFAULT_SERVICE_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    /// Bearer token sent to the completion service, read from `API_KEY`.
    pub api_key: String,
    #[serde(default = "default_service_url")]
    pub service_url: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_selection_timeout_secs")]
    pub selection_timeout_secs: u64,
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

fn default_service_url() -> String {
    DEFAULT_SERVICE_URL.to_string()
}

fn default_cache_dir() -> String {
    ".cache".to_string()
}

fn default_parallelism() -> usize {
    10
}

fn default_selection_timeout_secs() -> u64 {
    60
}

fn default_progress_interval_secs() -> u64 {
    30
}

fn load_sources() -> Result<Config, ConfigError> {
    // A missing .env file is fine; the environment may already be populated.
    dotenv::dotenv().ok();

    Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    load_sources()?.try_deserialize()
}

/// Cache directory from the same sources as [`get_config`], for commands that
/// only inspect the cache and need no API key.
pub fn get_cache_dir() -> Result<String, ConfigError> {
    cache_dir_from(&load_sources()?)
}

fn cache_dir_from(config: &Config) -> Result<String, ConfigError> {
    match config.get_string("cache_dir") {
        Err(ConfigError::NotFound(_)) => Ok(default_cache_dir()),
        other => other,
    }
}
