use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitor::matcher::ADDRESS_PATTERN;
use crate::monitor::types::Destination;

pub const DEFAULT_TWITTER_API_URL: &str = "https://api.twitter.com/2";
pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://xca_monitor.db";
pub const DEFAULT_KEYWORDS: &[&str] = &["contract", "address", "CA", "token"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be a valid number, got '{value}'")]
    InvalidNumber { key: String, value: String },

    #[error("{key} must be true or false, got '{value}'")]
    InvalidBool { key: String, value: String },

    #[error("{key} must be at least {min}")]
    OutOfRange { key: String, min: u64 },

    #[error("Invalid forwarding destination entry '{entry}'")]
    InvalidDestination { entry: String },
}

#[derive(Clone)]
pub struct Config {
    pub twitter: TwitterConfig,
    pub telegram: TelegramConfig,
    pub database: DatabaseConfig,
    pub monitoring: MonitoringConfig,
    pub api: ApiConfig,
    pub log_level: String,
}

#[derive(Clone)]
pub struct TwitterConfig {
    pub bearer_token: Option<String>,
    pub api_url: String,
    pub timeout_seconds: u64,
}

#[derive(Clone)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub api_url: String,
    pub primary_channel: Option<Destination>,
    pub forwarding_destinations: Vec<Destination>,
    pub include_post_text: bool,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    /// `None` disables retention trimming.
    pub max_stored_matches: Option<i64>,
}

/// What to watch and how often. Mutable at runtime through the settings
/// handle; each cycle reads a fresh copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub accounts: Vec<String>,
    pub regex_patterns: Vec<String>,
    pub keywords: Vec<String>,
    pub check_interval_minutes: u64,
    pub max_posts_per_check: usize,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            regex_patterns: vec![ADDRESS_PATTERN.to_string()],
            keywords: DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            check_interval_minutes: 15,
            max_posts_per_check: 20,
        }
    }
}

impl MonitoringConfig {
    /// Strip a leading `@` and drop blank entries.
    pub fn normalize(mut self) -> Self {
        self.accounts = self
            .accounts
            .iter()
            .map(|a| a.trim().trim_start_matches('@').to_string())
            .filter(|a| !a.is_empty())
            .collect();
        self.regex_patterns.retain(|p| !p.trim().is_empty());
        self.keywords.retain(|k| !k.trim().is_empty());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_minutes < 1 {
            return Err(ConfigError::OutOfRange {
                key: "check_interval_minutes".into(),
                min: 1,
            });
        }
        if self.max_posts_per_check < 1 {
            return Err(ConfigError::OutOfRange {
                key: "max_posts_per_check".into(),
                min: 1,
            });
        }
        Ok(())
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the config from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let twitter = TwitterConfig {
            bearer_token: get("TWITTER_BEARER_TOKEN"),
            api_url: get("TWITTER_API_URL").unwrap_or_else(|| DEFAULT_TWITTER_API_URL.to_string()),
            timeout_seconds: parse_number(&get, "TWITTER_TIMEOUT_SECONDS", 30)?,
        };

        let forwarding_destinations = match get("TELEGRAM_FORWARDING_DESTINATIONS") {
            Some(raw) => parse_destinations(&raw)?,
            None => Vec::new(),
        };

        let telegram = TelegramConfig {
            bot_token: get("TELEGRAM_BOT_TOKEN"),
            api_url: get("TELEGRAM_API_URL").unwrap_or_else(|| DEFAULT_TELEGRAM_API_URL.to_string()),
            primary_channel: get("TELEGRAM_PRIMARY_CHANNEL_ID").map(Destination::new),
            forwarding_destinations,
            include_post_text: parse_bool(&get, "TELEGRAM_INCLUDE_POST_TEXT", true)?,
            timeout_seconds: parse_number(&get, "TELEGRAM_TIMEOUT_SECONDS", 30)?,
        };

        let max_stored: i64 = parse_number(&get, "DATABASE_MAX_STORED_MATCHES", 1000)?;
        let database = DatabaseConfig {
            url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            max_stored_matches: (max_stored > 0).then_some(max_stored),
        };

        let defaults = MonitoringConfig::default();
        let monitoring = MonitoringConfig {
            accounts: get("MONITORING_ACCOUNTS")
                .map(|raw| split_list(&raw, ','))
                .unwrap_or_default(),
            regex_patterns: get("MONITORING_REGEX_PATTERNS")
                .map(|raw| split_list(&raw, ';'))
                .unwrap_or(defaults.regex_patterns),
            keywords: get("MONITORING_KEYWORDS")
                .map(|raw| split_list(&raw, ','))
                .unwrap_or(defaults.keywords),
            check_interval_minutes: parse_number(
                &get,
                "MONITORING_CHECK_INTERVAL_MINUTES",
                defaults.check_interval_minutes,
            )?,
            max_posts_per_check: parse_number(
                &get,
                "MONITORING_MAX_POSTS_PER_CHECK",
                defaults.max_posts_per_check,
            )?,
        }
        .normalize();

        // Report the env var name rather than the field name.
        monitoring.validate().map_err(|err| match err {
            ConfigError::OutOfRange { key, min } => ConfigError::OutOfRange {
                key: format!("MONITORING_{}", key.to_uppercase()),
                min,
            },
            other => other,
        })?;

        let api = ApiConfig {
            port: parse_number(&get, "API_PORT", 8000)?,
        };

        Ok(Self {
            twitter,
            telegram,
            database,
            monitoring,
            api,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Mask a secret for display: first and last four characters of long
/// values, `****` otherwise.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "****".to_string()
    }
}

fn mask_option(secret: &Option<String>) -> Option<String> {
    secret.as_deref().map(mask_secret)
}

impl fmt::Debug for TwitterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitterConfig")
            .field("bearer_token", &mask_option(&self.bearer_token))
            .field("api_url", &self.api_url)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &mask_option(&self.bot_token))
            .field("api_url", &self.api_url)
            .field("primary_channel", &self.primary_channel)
            .field("forwarding_destinations", &self.forwarding_destinations)
            .field("include_post_text", &self.include_post_text)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("twitter", &self.twitter)
            .field("telegram", &self.telegram)
            .field("database", &self.database)
            .field("monitoring", &self.monitoring)
            .field("api", &self.api)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse `chat_id[:label],...`.
fn parse_destinations(raw: &str) -> Result<Vec<Destination>, ConfigError> {
    split_list(raw, ',')
        .into_iter()
        .map(|entry| {
            let (chat_id, label) = match entry.split_once(':') {
                Some((id, label)) => (id.trim(), Some(label.trim())),
                None => (entry.as_str(), None),
            };
            if chat_id.is_empty() {
                return Err(ConfigError::InvalidDestination { entry: entry.clone() });
            }
            let destination = Destination::new(chat_id);
            Ok(match label.filter(|l| !l.is_empty()) {
                Some(label) => destination.with_label(label),
                None => destination,
            })
        })
        .collect()
}

fn parse_number<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value.parse::<T>().map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => match value.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value,
            }),
        },
        None => Ok(default),
    }
}
