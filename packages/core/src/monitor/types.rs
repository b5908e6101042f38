//! Core data types for the monitoring pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of post characters included in a notification.
pub const MAX_POST_TEXT_LENGTH: usize = 200;

/// A single post fetched from the post source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub account: String,
    pub text: String,
    pub permalink: String,
}

/// A post that satisfied at least one configured pattern or keyword.
///
/// `id` is `None` until the match has been persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: Option<i64>,
    pub post_id: String,
    pub account: String,
    pub text: String,
    pub matched_patterns: Vec<String>,
    pub extracted_values: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub permalink: String,
    pub delivered: bool,
    pub notified_destinations: Vec<String>,
}

impl Match {
    /// Build an unsaved match for `post` from a matcher result.
    pub fn from_post(post: &Post, outcome: PostMatch) -> Self {
        Self {
            id: None,
            post_id: post.id.clone(),
            account: post.account.clone(),
            text: post.text.clone(),
            matched_patterns: outcome.matched_patterns,
            extracted_values: outcome.extracted_values,
            created_at: Utc::now(),
            permalink: post.permalink.clone(),
            delivered: false,
            notified_destinations: Vec::new(),
        }
    }

    /// `true` if `destination` is already in the notified set.
    pub fn was_notified(&self, destination: &str) -> bool {
        self.notified_destinations.iter().any(|d| d == destination)
    }

    /// Render the notification text for this match.
    pub fn to_message(&self, include_post_text: bool) -> String {
        let mut parts = Vec::with_capacity(5);

        parts.push(format!("Account: @{}", self.account));

        if self.extracted_values.is_empty() {
            parts.push("No match value found".to_string());
        } else {
            parts.push(format!("Contract: {}", self.extracted_values.join(", ")));
        }

        if include_post_text && !self.text.is_empty() {
            parts.push(format!("Post: {}", truncate_chars(&self.text, MAX_POST_TEXT_LENGTH)));
        }

        parts.push(format!("Link: {}", self.permalink));
        parts.push(format!("Time: {}", self.created_at.format("%Y-%m-%d %H:%M UTC")));

        parts.join("\n")
    }
}

/// Output of the pattern matcher for one post.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostMatch {
    pub matched_patterns: Vec<String>,
    pub extracted_values: Vec<String>,
}

/// A chat that can receive notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Destination {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Aggregate counts over the match store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchStats {
    pub total: i64,
    pub today: i64,
    pub last_7_days: i64,
    pub unique_accounts: i64,
}

/// Summary of one poll → match → persist → notify pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub accounts_polled: usize,
    pub posts_scanned: usize,
    pub skipped_known: usize,
    pub rate_limited: bool,
    pub matches: Vec<Match>,
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_match(values: Vec<&str>, text: &str) -> Match {
        Match {
            id: Some(1),
            post_id: "42".into(),
            account: "alice".into(),
            text: text.into(),
            matched_patterns: vec!["airdrop".into()],
            extracted_values: values.into_iter().map(String::from).collect(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap(),
            permalink: "https://twitter.com/alice/status/42".into(),
            delivered: false,
            notified_destinations: vec![],
        }
    }

    #[test]
    fn message_lists_extracted_values() {
        let m = make_match(vec!["0xabc", "0xdef"], "hello");
        let msg = m.to_message(true);

        assert_eq!(
            msg,
            "Account: @alice\nContract: 0xabc, 0xdef\nPost: hello\n\
             Link: https://twitter.com/alice/status/42\nTime: 2024-03-09 14:05 UTC"
        );
    }

    #[test]
    fn message_without_values_says_so() {
        let msg = make_match(vec![], "hello").to_message(false);
        assert!(msg.contains("No match value found"));
        assert!(!msg.contains("Post:"));
    }

    #[test]
    fn long_post_text_is_truncated() {
        let text = "é".repeat(250);
        let msg = make_match(vec![], &text).to_message(true);
        let post_line = msg.lines().find(|l| l.starts_with("Post: ")).unwrap();

        assert_eq!(post_line, format!("Post: {}...", "é".repeat(200)));
    }

    #[test]
    fn was_notified_checks_set_membership() {
        let mut m = make_match(vec![], "x");
        m.notified_destinations.push("@chan".into());
        assert!(m.was_notified("@chan"));
        assert!(!m.was_notified("@other"));
    }
}
