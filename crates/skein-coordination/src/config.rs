//! Coordination client configuration.
//!
//! Layers are applied lowest first: built-in defaults, then a TOML file, then
//! `SKEIN_*` environment variables. Environment overrides touch the namespace
//! and the default channel only; per-channel tables come from TOML.
//!
//! ```toml
//! namespace = "billing"
//!
//! [default_channel]
//! interval_ms = 250
//!
//! [channels.jobs]
//! visibility_timeout_ms = 5000
//! max_retries = 10
//! dead_letter_channel = "jobs-dead"
//!
//! [channels.jobs.retry_visibility_timeout_ms]
//! 503 = 60000
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

use crate::constants::DEFAULT_MAX_TIMEOUT_MS;
use crate::constants::DEFAULT_NAMESPACE;
use crate::constants::DEFAULT_POLL_INTERVAL_MS;
use crate::constants::DEFAULT_RETRY_INTERVAL_MS;
use crate::constants::DEFAULT_VISIBILITY_TIMEOUT_MS;

/// Per-channel consumer settings. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Delay between polls after a message was handled.
    #[serde(alias = "interval")]
    pub interval_ms: u64,

    /// Delay between polls after an empty poll or a store error.
    #[serde(alias = "retryInterval")]
    pub retry_interval_ms: u64,

    /// Lease duration. 0 disables leasing: popped messages are not tracked.
    #[serde(alias = "visibilityTimeout")]
    pub visibility_timeout_ms: u64,

    /// Upper bound on how far ahead a not-yet-due message is parked.
    #[serde(alias = "maxTimeout")]
    pub max_timeout_ms: u64,

    /// Ready backlog above which a monitor sweep flags the channel (0 = off).
    pub threshold: u64,

    /// Channel-level retry lease per handler status code. A message's own
    /// `retryVisibilityTimeout` entry wins over this one.
    #[serde(alias = "retryVisibilityTimeout")]
    pub retry_visibility_timeout_ms: BTreeMap<String, u64>,

    /// Cap on redeliveries after retryable failures (None = retry forever).
    pub max_retries: Option<u32>,

    /// Where capped messages go. Dropped when unset.
    pub dead_letter_channel: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            visibility_timeout_ms: DEFAULT_VISIBILITY_TIMEOUT_MS,
            max_timeout_ms: DEFAULT_MAX_TIMEOUT_MS,
            threshold: 0,
            retry_visibility_timeout_ms: BTreeMap::new(),
            max_retries: None,
            dead_letter_channel: None,
        }
    }
}

impl ChannelConfig {
    pub fn with_visibility_timeout_ms(mut self, visibility_timeout_ms: u64) -> Self {
        self.visibility_timeout_ms = visibility_timeout_ms;
        self
    }

    pub fn with_intervals_ms(mut self, interval_ms: u64, retry_interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self.retry_interval_ms = retry_interval_ms;
        self
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_retry_timeout_ms(mut self, status: u16, timeout_ms: u64) -> Self {
        self.retry_visibility_timeout_ms.insert(status.to_string(), timeout_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32, dead_letter_channel: Option<String>) -> Self {
        self.max_retries = Some(max_retries);
        self.dead_letter_channel = dead_letter_channel;
        self
    }

    /// Channel-level retry lease for a handler status, if configured.
    pub fn retry_timeout_for(&self, status: u16) -> Option<u64> {
        self.retry_visibility_timeout_ms.get(&status.to_string()).copied()
    }

    /// Period of the monitor sweep: the lease duration, or the poll interval
    /// for non-leased channels.
    pub fn monitor_period_ms(&self) -> u64 {
        if self.visibility_timeout_ms > 0 {
            self.visibility_timeout_ms
        } else {
            self.interval_ms
        }
    }

    fn validate(&self, channel: &str) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Validation {
                message: format!("channel '{channel}': interval_ms must be non-zero"),
            });
        }
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::Validation {
                message: format!("channel '{channel}': retry_interval_ms must be non-zero"),
            });
        }
        if self.max_timeout_ms < self.visibility_timeout_ms {
            return Err(ConfigError::Validation {
                message: format!(
                    "channel '{channel}': max_timeout_ms ({}) must be >= visibility_timeout_ms ({})",
                    self.max_timeout_ms, self.visibility_timeout_ms
                ),
            });
        }
        for status in self.retry_visibility_timeout_ms.keys() {
            if status.parse::<u16>().is_err() {
                return Err(ConfigError::Validation {
                    message: format!("channel '{channel}': retry status '{status}' is not a status code"),
                });
            }
        }
        if self.dead_letter_channel.is_some() && self.max_retries.is_none() {
            return Err(ConfigError::Validation {
                message: format!("channel '{channel}': dead_letter_channel requires max_retries"),
            });
        }
        if self.dead_letter_channel.as_deref() == Some(channel) {
            return Err(ConfigError::Validation {
                message: format!("channel '{channel}': dead_letter_channel cannot be the channel itself"),
            });
        }
        Ok(())
    }
}

/// Top-level configuration for a [`CoordinationClient`](crate::CoordinationClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Prefix for every store key.
    pub namespace: String,

    /// Settings for channels without their own table.
    pub default_channel: ChannelConfig,

    /// Per-channel settings.
    pub channels: BTreeMap<String, ChannelConfig>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            default_channel: ChannelConfig::default(),
            channels: BTreeMap::new(),
        }
    }
}

impl CoordinationConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_channel(mut self, name: impl Into<String>, channel: ChannelConfig) -> Self {
        self.channels.insert(name.into(), channel);
        self
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).context(ParseTomlSnafu {
            origin: "<inline>".to_string(),
        })
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&content).context(ParseTomlSnafu {
            origin: path.display().to_string(),
        })
    }

    /// Defaults with `SKEIN_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `SKEIN_*` environment variables on top of this configuration.
    ///
    /// Unset or unparseable variables leave the current value alone.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(namespace) = lookup("SKEIN_NAMESPACE").filter(|ns| !ns.trim().is_empty()) {
            self.namespace = namespace.trim().to_string();
        }
        let channel = &mut self.default_channel;
        if let Some(v) = parse("SKEIN_INTERVAL_MS") {
            channel.interval_ms = v;
        }
        if let Some(v) = parse("SKEIN_RETRY_INTERVAL_MS") {
            channel.retry_interval_ms = v;
        }
        if let Some(v) = parse("SKEIN_VISIBILITY_TIMEOUT_MS") {
            channel.visibility_timeout_ms = v;
        }
        if let Some(v) = parse("SKEIN_MAX_TIMEOUT_MS") {
            channel.max_timeout_ms = v;
        }
        if let Some(v) = parse("SKEIN_THRESHOLD") {
            channel.threshold = v;
        }
    }

    /// Settings for `name`, falling back to the default channel.
    pub fn channel(&self, name: &str) -> &ChannelConfig {
        self.channels.get(name).unwrap_or(&self.default_channel)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "namespace must not be empty".into(),
            });
        }
        if self.namespace.contains(':') {
            return Err(ConfigError::Validation {
                message: format!("namespace '{}' must not contain ':'", self.namespace),
            });
        }
        self.default_channel.validate("<default>")?;
        for (name, channel) in &self.channels {
            channel.validate(name)?;
        }
        Ok(())
    }
}

/// Configuration loading and parsing errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse TOML config {origin}: {source}"))]
    ParseToml { origin: String, source: toml::de::Error },

    #[snafu(display("configuration validation failed: {message}"))]
    Validation { message: String },
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoordinationConfig::default();
        let ch = &config.default_channel;
        assert_eq!(config.namespace, "skein");
        assert_eq!(ch.interval_ms, 500);
        assert_eq!(ch.retry_interval_ms, 1000);
        assert_eq!(ch.visibility_timeout_ms, 30_000);
        assert_eq!(ch.max_timeout_ms, 3_600_000);
        assert_eq!(ch.threshold, 0);
        assert!(ch.max_retries.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn parses_toml_with_channel_tables() {
        let config = CoordinationConfig::from_toml_str(
            r#"
            namespace = "billing"

            [default_channel]
            interval_ms = 250

            [channels.jobs]
            visibilityTimeout = 5000
            max_retries = 3
            dead_letter_channel = "jobs-dead"

            [channels.jobs.retry_visibility_timeout_ms]
            503 = 60000
            "#,
        )
        .unwrap();

        assert_eq!(config.namespace, "billing");
        assert_eq!(config.default_channel.interval_ms, 250);
        let jobs = config.channel("jobs");
        assert_eq!(jobs.visibility_timeout_ms, 5000);
        assert_eq!(jobs.interval_ms, 500);
        assert_eq!(jobs.retry_timeout_for(503), Some(60_000));
        assert_eq!(jobs.retry_timeout_for(500), None);
        assert_eq!(config.channel("other").interval_ms, 250);
        config.validate().unwrap();
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let err = CoordinationConfig::from_toml_str("namespace = [").unwrap_err();
        assert!(matches!(err, ConfigError::ParseToml { .. }));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = CoordinationConfig::from_toml_file(Path::new("/nonexistent/skein.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn env_overrides_win_over_toml() {
        let mut config =
            CoordinationConfig::from_toml_str("namespace = \"a\"\n[default_channel]\ninterval_ms = 200\n").unwrap();
        let vars: HashMap<&str, &str> = [
            ("SKEIN_NAMESPACE", "b"),
            ("SKEIN_INTERVAL_MS", "75"),
            ("SKEIN_THRESHOLD", "not-a-number"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.namespace, "b");
        assert_eq!(config.default_channel.interval_ms, 75);
        assert_eq!(config.default_channel.threshold, 0);
    }

    #[test]
    fn validation_rejects_bad_channels() {
        let zero_interval =
            CoordinationConfig::default().with_channel("a", ChannelConfig::default().with_intervals_ms(0, 10));
        assert!(matches!(zero_interval.validate(), Err(ConfigError::Validation { .. })));

        let short_max = CoordinationConfig::default().with_channel(
            "a",
            ChannelConfig {
                max_timeout_ms: 10,
                ..ChannelConfig::default()
            },
        );
        assert!(short_max.validate().is_err());

        let self_dead_letter = CoordinationConfig::default()
            .with_channel("a", ChannelConfig::default().with_max_retries(1, Some("a".into())));
        assert!(self_dead_letter.validate().is_err());

        assert!(CoordinationConfig::new(" ").validate().is_err());
    }

    #[test]
    fn monitor_period_falls_back_to_interval() {
        let leased = ChannelConfig::default().with_visibility_timeout_ms(5000);
        assert_eq!(leased.monitor_period_ms(), 5000);
        let unleased = ChannelConfig::default().with_visibility_timeout_ms(0);
        assert_eq!(unleased.monitor_period_ms(), 500);
    }
}
