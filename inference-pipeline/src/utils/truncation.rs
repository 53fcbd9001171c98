use std::borrow::Cow;

use common::error::AppError;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::debug;

pub const DEFAULT_PROMPT_TOKEN_LIMIT: usize = 3_800;

/// Cuts prompts down to a token budget before they are sent.
pub struct PromptTruncator {
    bpe: CoreBPE,
    max_tokens: usize,
}

impl PromptTruncator {
    pub fn new(max_tokens: usize) -> Result<Self, AppError> {
        let bpe = cl100k_base()
            .map_err(|e| AppError::Tokenizer(format!("failed to load cl100k_base: {e}")))?;
        Ok(Self { bpe, max_tokens })
    }

    /// Returns `prompt` unchanged when it fits, otherwise its first
    /// `max_tokens` tokens decoded back to text.
    pub fn truncate<'a>(&self, prompt: &'a str) -> Cow<'a, str> {
        let tokens = self.bpe.encode_ordinary(prompt);
        if tokens.len() <= self.max_tokens {
            return Cow::Borrowed(prompt);
        }

        // A cut can land inside a multi-byte character; step back until the
        // prefix decodes.
        let mut keep = self.max_tokens;
        while keep > 0 {
            let Some(prefix) = tokens.get(..keep) else {
                break;
            };
            if let Ok(text) = self.bpe.decode(prefix.to_vec()) {
                debug!(
                    original_tokens = tokens.len(),
                    kept_tokens = keep,
                    "truncated prompt"
                );
                return Cow::Owned(text);
            }
            keep = keep.saturating_sub(1);
        }
        Cow::Owned(String::new())
    }
}

impl std::fmt::Debug for PromptTruncator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptTruncator")
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}
