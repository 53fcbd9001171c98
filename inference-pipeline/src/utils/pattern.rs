use common::error::AppError;
use regex::Regex;

/// Why a response could not be turned into an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternMismatch {
    NoMatch,
    MultipleMatches(usize),
}

impl std::fmt::Display for PatternMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoMatch => write!(f, "parse pattern not detected"),
            Self::MultipleMatches(count) => {
                write!(f, "detected {count} matches, expected exactly one")
            }
        }
    }
}

/// Caller-supplied pattern that must match a response exactly once.
#[derive(Debug, Clone)]
pub struct ResponsePattern {
    regex: Regex,
}

impl ResponsePattern {
    pub fn new(pattern: &str) -> Result<Self, AppError> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Captured groups of the single match, in group order. Unmatched
    /// optional groups become empty strings. A pattern without groups yields
    /// the whole match.
    pub fn extract(&self, text: &str) -> Result<Vec<String>, PatternMismatch> {
        let mut matches = self.regex.captures_iter(text);
        let Some(first) = matches.next() else {
            return Err(PatternMismatch::NoMatch);
        };
        let extra = matches.count();
        if extra > 0 {
            return Err(PatternMismatch::MultipleMatches(extra.saturating_add(1)));
        }

        let group_count = self.regex.captures_len().saturating_sub(1);
        if group_count == 0 {
            return Ok(first
                .get(0)
                .map(|m| vec![m.as_str().to_string()])
                .unwrap_or_default());
        }

        Ok((1..=group_count)
            .map(|idx| first.get(idx).map_or_else(String::new, |m| m.as_str().to_string()))
            .collect())
    }
}
