use std::path::Path;

use common::error::AppError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::types::PromptSet;

pub const IDENTITY_FILE_NAME: &str = "cache_identify.json";

/// Content fingerprint of a prompt set, persisted alongside a cache batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIdentity {
    pub prompts_hash: String,
    pub system_prompts_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
}

impl CacheIdentity {
    pub fn for_prompt_set(prompt_set: &PromptSet) -> Self {
        let (prompts_hash, system_prompts_hash) = fingerprint(prompt_set);
        Self {
            prompts_hash,
            system_prompts_hash,
            prompt_count: Some(prompt_set.len()),
            chunk_count: None,
        }
    }

    /// Two identities describe the same batch when both hashes agree; the
    /// bookkeeping counts do not take part.
    pub fn same_content(&self, other: &Self) -> bool {
        self.prompts_hash == other.prompts_hash
            && self.system_prompts_hash == other.system_prompts_hash
    }

    pub async fn load(dir: &Path) -> Result<Option<Self>, AppError> {
        let path = dir.join(IDENTITY_FILE_NAME);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let raw = tokio::fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    pub async fn store(&self, dir: &Path) -> Result<(), AppError> {
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(dir.join(IDENTITY_FILE_NAME), body).await?;
        Ok(())
    }
}

/// SHA-256 hex digests of the prompt list and of the system-prompt list.
///
/// Both lists hash their JSON array form. An absent system-prompt list hashes
/// the JSON literal `null`, so it never collides with an empty list.
pub fn fingerprint(prompt_set: &PromptSet) -> (String, String) {
    let prompts_hash = hash_json(&prompt_set.prompts());
    let system_prompts_hash = hash_json(&prompt_set.system_prompts());
    (prompts_hash, system_prompts_hash)
}

fn hash_json<T: Serialize + ?Sized>(value: &T) -> String {
    // Serializing slices of strings and `Option` cannot fail.
    let canonical = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    format!("{:x}", hasher.finalize())
}

/// Whether `candidate_dir` holds a cache batch for `prompt_set`. Missing or
/// unreadable identity records never match.
pub async fn matches(candidate_dir: &Path, prompt_set: &PromptSet) -> bool {
    match CacheIdentity::load(candidate_dir).await {
        Ok(Some(stored)) => stored.same_content(&CacheIdentity::for_prompt_set(prompt_set)),
        Ok(None) => false,
        Err(err) => {
            debug!(
                dir = %candidate_dir.display(),
                error = %err,
                "ignoring cache directory with unreadable identity"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SystemPrompts;

    fn set(prompts: &[&str], system: SystemPrompts) -> PromptSet {
        PromptSet::new(prompts.iter().map(|p| (*p).to_string()).collect(), system).unwrap()
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = set(&["Q1", "Q2"], SystemPrompts::None);
        let b = set(&["Q1", "Q2"], SystemPrompts::None);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn changing_one_prompt_or_the_order_changes_the_hash() {
        let base = fingerprint(&set(&["Q1", "Q2", "Q3"], SystemPrompts::None));
        let edited = fingerprint(&set(&["Q1", "Q2!", "Q3"], SystemPrompts::None));
        let reordered = fingerprint(&set(&["Q2", "Q1", "Q3"], SystemPrompts::None));

        assert_ne!(base.0, edited.0);
        assert_ne!(base.0, reordered.0);
        assert_eq!(base.1, edited.1);
    }

    #[test]
    fn system_prompts_change_only_the_second_hash() {
        let plain = fingerprint(&set(&["Q1"], SystemPrompts::None));
        let with_system = fingerprint(&set(&["Q1"], SystemPrompts::Shared("be brief".into())));
        let other_system = fingerprint(&set(&["Q1"], SystemPrompts::Shared("be long".into())));

        assert_eq!(plain.0, with_system.0);
        assert_ne!(plain.1, with_system.1);
        assert_ne!(with_system.1, other_system.1);
    }

    #[test]
    fn absent_and_empty_system_prompts_differ() {
        let absent = fingerprint(&set(&[], SystemPrompts::None));
        let empty = fingerprint(&set(&[], SystemPrompts::PerPrompt(Vec::new())));
        assert_ne!(absent.1, empty.1);
    }

    #[tokio::test]
    async fn matches_requires_a_readable_identical_record() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = set(&["Q1", "Q2"], SystemPrompts::None);

        assert!(!matches(dir.path(), &prompts).await);

        tokio::fs::write(dir.path().join(IDENTITY_FILE_NAME), b"not json")
            .await
            .unwrap();
        assert!(!matches(dir.path(), &prompts).await);

        let mut identity = CacheIdentity::for_prompt_set(&prompts);
        identity.chunk_count = Some(2);
        identity.store(dir.path()).await.unwrap();
        assert!(matches(dir.path(), &prompts).await);

        let other = set(&["Q1", "Q3"], SystemPrompts::None);
        assert!(!matches(dir.path(), &other).await);
    }
}
