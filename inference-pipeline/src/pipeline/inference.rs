use std::sync::Arc;

use common::error::AppError;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::{
    config::{InferenceParams, RetryPolicy},
    services::{ChatMessage, ChatRequest, CompletionService},
};
use crate::{types::InferenceOutcome, utils::truncation::PromptTruncator};

/// Sends single prompts to the completion service and turns replies into
/// answers. Built once per run and shared by every chunk worker.
pub struct InferenceClient {
    service: Arc<dyn CompletionService>,
    truncator: Arc<PromptTruncator>,
    retry: RetryPolicy,
}

impl InferenceClient {
    pub fn new(
        service: Arc<dyn CompletionService>,
        truncator: Arc<PromptTruncator>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            service,
            truncator,
            retry,
        }
    }

    pub fn build_request(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        params: &InferenceParams,
    ) -> Result<ChatRequest, AppError> {
        let prompt = self.truncator.truncate(prompt);
        let mut messages = Vec::with_capacity(2);
        if let Some(system_prompt) = system_prompt {
            messages.push(ChatMessage::system(system_prompt));
        }
        messages.push(ChatMessage::user(prompt.into_owned()));

        Ok(ChatRequest {
            model: params.model.clone(),
            messages,
            seed: params.seed()?,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
        })
    }

    /// Answers one prompt.
    ///
    /// Service errors back off and retry, without limit unless
    /// `max_service_retries` is set, in which case exhausting it is an error.
    /// Replies that match the pattern zero or several times back off and
    /// retry up to `max_parse_retries` times, then settle on
    /// [`InferenceOutcome::ParseFailed`].
    pub async fn infer(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        params: &InferenceParams,
    ) -> Result<InferenceOutcome, AppError> {
        let request = self.build_request(prompt, system_prompt, params)?;
        let mut service_failures: u32 = 0;
        let mut parse_failures: u32 = 0;

        loop {
            let reply = match self.service.complete(&request).await {
                Ok(reply) => reply,
                Err(err) => {
                    error!(
                        model = %params.model,
                        error = %err,
                        service_failures,
                        "service error"
                    );
                    if let Some(max) = self.retry.max_service_retries {
                        if service_failures >= max {
                            return Err(AppError::Service(format!(
                                "giving up after {max} service retries: {err}"
                            )));
                        }
                    }
                    sleep(self.retry.delay(service_failures)).await;
                    service_failures = service_failures.saturating_add(1);
                    continue;
                }
            };

            match reply.system_fingerprint.as_deref() {
                Some(fingerprint) => info!(
                    model = %params.model,
                    system_fingerprint = fingerprint,
                    "request finished"
                ),
                None => info!(
                    model = %params.model,
                    "request finished, no system fingerprint in response"
                ),
            }

            let text = reply.content.trim();
            match params.pattern.extract(text) {
                Ok(groups) => return Ok(InferenceOutcome::Parsed(groups)),
                Err(mismatch) => {
                    error!(
                        model = %params.model,
                        error = %mismatch,
                        raw = text,
                        parse_failures,
                        "parse error"
                    );
                    if parse_failures >= self.retry.max_parse_retries {
                        warn!(
                            model = %params.model,
                            attempts = parse_failures.saturating_add(1),
                            "no parsable answer; recording a null result"
                        );
                        return Ok(InferenceOutcome::ParseFailed);
                    }
                    sleep(self.retry.delay(parse_failures)).await;
                    parse_failures = parse_failures.saturating_add(1);
                }
            }
        }
    }
}
