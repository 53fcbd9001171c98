use std::time::Duration;

use async_trait::async_trait;
use common::error::AppError;
use serde::Serialize;
use serde_json::Value;

use super::config::ServiceConfig;

const RAW_SNIPPET_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

/// Body of one chat-completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub seed: i64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub content: String,
    pub system_fingerprint: Option<String>,
}

/// The remote side of an inference call. Every error returned here is
/// treated as a transient service error and retried.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, AppError>;
}

/// OpenAI-compatible chat-completion endpoint over HTTP.
pub struct HttpCompletionService {
    client: reqwest::Client,
    config: ServiceConfig,
}

impl HttpCompletionService {
    pub fn new(config: ServiceConfig, request_timeout: Duration) -> Result<Self, AppError> {
        if config.api_key.trim().is_empty() {
            return Err(AppError::Validation("API key must not be empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, AppError> {
        let response = self
            .client
            .post(&self.config.service_url)
            .bearer_auth(&self.config.api_key)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(AppError::Service(format!(
                "status {status}; body: {}",
                snippet(&body)
            )));
        }
        parse_reply(&body)
    }
}

/// Pulls `choices[0].message.content` out of a response body.
pub fn parse_reply(body: &str) -> Result<ChatReply, AppError> {
    let value: Value = serde_json::from_str(body).map_err(|e| {
        AppError::Service(format!("malformed response ({e}); body: {}", snippet(body)))
    })?;

    let content = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            AppError::Service(format!(
                "response has no choices[0].message.content; body: {}",
                snippet(body)
            ))
        })?;

    Ok(ChatReply {
        content: content.to_string(),
        system_fingerprint: value
            .get("system_fingerprint")
            .and_then(Value::as_str)
            .map(str::to_owned),
    })
}

fn snippet(body: &str) -> String {
    if body.chars().count() <= RAW_SNIPPET_CHARS {
        return body.to_string();
    }
    let mut cut: String = body.chars().take(RAW_SNIPPET_CHARS).collect();
    cut.push('…');
    cut
}
