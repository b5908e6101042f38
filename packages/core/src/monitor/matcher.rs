//! Pattern matcher.
//!
//! Evaluates post text against the configured regexes and keywords. Labels
//! are reported regex patterns first, then keywords, each in configured
//! order. Patterns listed in [`EXTRACTING_PATTERNS`] additionally yield every
//! matched substring as an extracted value.

use regex::{Regex, RegexBuilder};

use crate::monitor::types::PostMatch;

/// EVM contract address.
pub const ADDRESS_PATTERN: &str = "0x[a-fA-F0-9]{40}";

/// Ticker symbol such as `$PEPE`.
pub const TICKER_PATTERN: &str = r"\$[A-Za-z][A-Za-z0-9]+";

/// Patterns whose matches are extracted as structured values.
pub const EXTRACTING_PATTERNS: &[&str] = &[ADDRESS_PATTERN, TICKER_PATTERN];

#[derive(Debug, Clone)]
struct CompiledPattern {
    source: String,
    regex: Regex,
    extracting: bool,
}

/// A compiled, immutable set of patterns and keywords.
#[derive(Debug, Clone, Default)]
pub struct PatternMatcher {
    patterns: Vec<CompiledPattern>,
    keywords: Vec<(String, String)>,
}

impl PatternMatcher {
    /// Compile `patterns` case-insensitively. Invalid patterns are skipped
    /// with a warning and never prevent the rest from compiling.
    pub fn compile<P, K>(patterns: &[P], keywords: &[K]) -> Self
    where
        P: AsRef<str>,
        K: AsRef<str>,
    {
        let mut compiled = Vec::with_capacity(patterns.len());

        for pattern in patterns {
            let source = pattern.as_ref();
            match RegexBuilder::new(source).case_insensitive(true).build() {
                Ok(regex) => compiled.push(CompiledPattern {
                    source: source.to_string(),
                    regex,
                    extracting: EXTRACTING_PATTERNS.contains(&source),
                }),
                Err(err) => {
                    tracing::warn!("Skipping invalid regex pattern '{}': {}", source, err);
                }
            }
        }

        let keywords = keywords
            .iter()
            .map(|k| k.as_ref())
            .filter(|k| !k.is_empty())
            .map(|k| (k.to_string(), k.to_lowercase()))
            .collect();

        Self {
            patterns: compiled,
            keywords,
        }
    }

    /// Number of patterns that compiled successfully.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }

    /// Match `text`, returning `None` when nothing matched.
    pub fn match_text(&self, text: &str) -> Option<PostMatch> {
        let mut outcome = PostMatch::default();

        for pattern in &self.patterns {
            if pattern.extracting {
                let found: Vec<String> = pattern
                    .regex
                    .find_iter(text)
                    .map(|m| m.as_str().to_string())
                    .collect();
                if !found.is_empty() {
                    outcome.matched_patterns.push(pattern.source.clone());
                    outcome.extracted_values.extend(found);
                }
            } else if pattern.regex.is_match(text) {
                outcome.matched_patterns.push(pattern.source.clone());
            }
        }

        let lowered = text.to_lowercase();
        for (label, needle) in &self.keywords {
            if lowered.contains(needle.as_str()) {
                outcome.matched_patterns.push(label.clone());
            }
        }

        if outcome.matched_patterns.is_empty() {
            None
        } else {
            Some(outcome)
        }
    }
}
