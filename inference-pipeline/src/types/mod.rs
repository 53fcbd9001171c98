use common::error::AppError;
use serde::{Deserialize, Serialize};

/// System prompts as supplied by the caller, before expansion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SystemPrompts {
    #[default]
    None,
    /// One system prompt broadcast to every user prompt.
    Shared(String),
    /// One system prompt per user prompt, index-aligned.
    PerPrompt(Vec<String>),
}

/// Ordered batch of prompts with their (already expanded) system prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    prompts: Vec<String>,
    system_prompts: Option<Vec<String>>,
}

impl PromptSet {
    pub fn new(prompts: Vec<String>, system_prompts: SystemPrompts) -> Result<Self, AppError> {
        let system_prompts = match system_prompts {
            SystemPrompts::None => None,
            SystemPrompts::Shared(system_prompt) => Some(vec![system_prompt; prompts.len()]),
            SystemPrompts::PerPrompt(list) => {
                if list.len() != prompts.len() {
                    return Err(AppError::Validation(format!(
                        "got {} system prompts for {} prompts",
                        list.len(),
                        prompts.len()
                    )));
                }
                Some(list)
            }
        };

        Ok(Self {
            prompts,
            system_prompts,
        })
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn system_prompts(&self) -> Option<&[String]> {
        self.system_prompts.as_deref()
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Rows in prompt order, as they are written to chunk files.
    pub fn rows(&self) -> Vec<PromptRow> {
        self.prompts
            .iter()
            .enumerate()
            .map(|(idx, prompt)| PromptRow {
                prompt: prompt.clone(),
                system_prompt: self
                    .system_prompts
                    .as_ref()
                    .and_then(|list| list.get(idx).cloned()),
            })
            .collect()
    }
}

/// One row of a chunk file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRow {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// One row of a progress file: the chunk row plus its answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRow {
    #[serde(flatten)]
    pub row: PromptRow,
    pub llm_response: InferenceOutcome,
}

/// Answer extracted for one prompt.
///
/// Stored as a JSON array: `["A", "reason"]` for captured groups, `[null]`
/// when the response never matched the pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Option<String>>", into = "Vec<Option<String>>")]
pub enum InferenceOutcome {
    Parsed(Vec<String>),
    ParseFailed,
}

impl InferenceOutcome {
    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed(_))
    }
}

impl From<Vec<Option<String>>> for InferenceOutcome {
    fn from(values: Vec<Option<String>>) -> Self {
        if values.is_empty() {
            return Self::ParseFailed;
        }
        values
            .into_iter()
            .collect::<Option<Vec<String>>>()
            .map_or(Self::ParseFailed, Self::Parsed)
    }
}

impl From<InferenceOutcome> for Vec<Option<String>> {
    fn from(outcome: InferenceOutcome) -> Self {
        match outcome {
            InferenceOutcome::Parsed(groups) => groups.into_iter().map(Some).collect(),
            InferenceOutcome::ParseFailed => vec![None],
        }
    }
}
