//! Acceptance checks for generated wake-up text.

use std::collections::HashSet;

use thiserror::Error;

use crate::config::GenerationConfig;

const MOTIVATIONAL_LEXICON: &[&str] = &[
    "today", "morning", "rise", "ready", "start", "goal", "goals", "focus", "energy", "strong",
    "great", "win", "progress", "believe", "achieve", "momentum", "awake", "wake", "day",
    "possible", "go", "can", "let's", "lets", "shine", "breathe", "step", "fresh", "new",
    "proud", "forward", "time",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TextRejection {
    #[error("text too short ({len} < {min} chars)")]
    TooShort { len: usize, min: usize },

    #[error("text too long ({len} > {max} chars)")]
    TooLong { len: usize, max: usize },

    #[error("text contains blocked word {0:?}")]
    BlockedWord(String),

    #[error("text is not motivational enough ({hits} < {min} cues)")]
    NotMotivational { hits: usize, min: usize },
}

#[derive(Debug, Clone)]
pub struct TextValidator {
    min_chars: usize,
    max_chars: usize,
    min_motivational_hits: usize,
    blocked: HashSet<String>,
}

impl From<&GenerationConfig> for TextValidator {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            min_chars: config.min_text_chars,
            max_chars: config.max_text_chars,
            min_motivational_hits: config.min_motivational_hits,
            blocked: config
                .blocked_words
                .iter()
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(|w| w.trim_matches('\'').to_lowercase())
}

/// Strip wrapping quotes and collapse whitespace.
pub fn clean(text: &str) -> String {
    let trimmed = text
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\u{201c}' | '\u{201d}'))
        .trim();
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl TextValidator {
    /// Returns the cleaned text when it is acceptable.
    pub fn validate(&self, text: &str) -> Result<String, TextRejection> {
        let text = clean(text);
        let len = text.chars().count();
        if len < self.min_chars {
            return Err(TextRejection::TooShort {
                len,
                min: self.min_chars,
            });
        }
        if len > self.max_chars {
            return Err(TextRejection::TooLong {
                len,
                max: self.max_chars,
            });
        }

        let mut cues = HashSet::new();
        for word in words(&text) {
            if self.blocked.contains(&word) {
                return Err(TextRejection::BlockedWord(word));
            }
            if MOTIVATIONAL_LEXICON.contains(&word.as_str()) {
                cues.insert(word);
            }
        }
        if cues.len() < self.min_motivational_hits {
            return Err(TextRejection::NotMotivational {
                hits: cues.len(),
                min: self.min_motivational_hits,
            });
        }
        Ok(text)
    }
}
