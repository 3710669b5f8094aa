//! Fuzzy keyword matching for spoken dismissals.

use crate::config::DismissalConfig;

/// Lowercase, drop apostrophes, turn other punctuation into spaces and
/// collapse whitespace. "I'm up!" becomes "im up".
pub fn normalize(text: &str) -> String {
    let mapped: String = text
        .chars()
        .filter(|c| !matches!(c, '\'' | '\u{2019}' | '`'))
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Character-level edit distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordMatch {
    pub keyword: String,
    pub heard: String,
    pub distance: usize,
}

#[derive(Debug, Clone)]
pub struct VoiceMatcher {
    keywords: Vec<String>,
    max_distance: usize,
}

impl VoiceMatcher {
    pub fn new(keywords: &[String], max_distance: usize) -> Self {
        let keywords = keywords
            .iter()
            .map(|k| normalize(k))
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            keywords,
            max_distance,
        }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Short keywords get a tighter budget so "up" does not match "no".
    fn allowed_distance(&self, keyword: &str) -> usize {
        let half = (keyword.chars().count() / 2).max(1);
        self.max_distance.min(half)
    }

    /// Best keyword match in `transcript`, compared against the whole
    /// utterance and every word window as long as the keyword.
    pub fn best_match(&self, transcript: &str) -> Option<KeywordMatch> {
        let heard = normalize(transcript);
        if heard.is_empty() {
            return None;
        }
        let words: Vec<&str> = heard.split(' ').collect();

        let mut best: Option<KeywordMatch> = None;
        for keyword in &self.keywords {
            let allowed = self.allowed_distance(keyword);
            let width = keyword.split(' ').count();

            let mut candidates = vec![heard.clone()];
            if width <= words.len() {
                candidates.extend(words.windows(width).map(|w| w.join(" ")));
            }

            for candidate in candidates {
                let distance = levenshtein(keyword, &candidate);
                if distance > allowed {
                    continue;
                }
                if best.as_ref().map_or(true, |b| distance < b.distance) {
                    best = Some(KeywordMatch {
                        keyword: keyword.clone(),
                        heard: candidate,
                        distance,
                    });
                }
            }
        }
        best
    }
}

impl From<&DismissalConfig> for VoiceMatcher {
    fn from(config: &DismissalConfig) -> Self {
        Self::new(&config.keywords, config.max_distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> VoiceMatcher {
        VoiceMatcher::from(&DismissalConfig::default())
    }

    #[test]
    fn normalizes_punctuation_and_case() {
        assert_eq!(normalize("  I'm   UP!! "), "im up");
        assert_eq!(normalize("stop-alarm, please"), "stop alarm please");
        assert_eq!(normalize("I\u{2019}m awake."), "im awake");
        assert_eq!(normalize("?!"), "");
    }

    #[test]
    fn edit_distance() {
        assert_eq!(levenshtein("im up", "im up"), 0);
        assert_eq!(levenshtein("im up", "i am up"), 2);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
    }

    #[test]
    fn matches_fuzzy_phrases_inside_longer_utterances() {
        let m = matcher();
        let hit = m.best_match("I'm up").unwrap();
        assert_eq!(hit.keyword, "im up");
        assert_eq!(hit.distance, 0);

        let hit = m.best_match("okay okay I'm upp now").unwrap();
        assert_eq!(hit.heard, "im upp");
        assert_eq!(hit.distance, 1);

        assert!(m.best_match("good mornin").is_some());
        assert!(m.best_match("five more minutes").is_none());
        assert!(m.best_match("").is_none());
    }

    #[test]
    fn short_keywords_get_a_tight_budget() {
        let m = VoiceMatcher::new(&["up".to_string()], 2);
        assert!(m.best_match("up").is_some());
        assert!(m.best_match("op").is_some());
        assert!(m.best_match("no").is_none());
    }
}
