//! Client and receiver configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use hubstream_core::ConsumerGroup;

/// Default prefetch depth (events buffered ahead of the caller, per receiver).
pub const DEFAULT_PREFETCH: usize = 300;

/// Default `max_batch_size` for `receive_batch`.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;

pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}': {reason}")]
    Parse {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("malformed configuration document: {0}")]
    Document(String),
}

/// Client-wide settings; every receiver inherits them unless overridden by
/// [`ReceiverOptions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub consumer_group: ConsumerGroup,
    pub prefetch: usize,
    pub max_batch_size: usize,
    #[serde(rename = "open_timeout_ms", with = "millis")]
    pub open_timeout: Duration,
    #[serde(rename = "receive_timeout_ms", with = "millis")]
    pub default_receive_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            consumer_group: ConsumerGroup::default_group(),
            prefetch: DEFAULT_PREFETCH,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            default_receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Load from `HUBSTREAM_*` environment variables, falling back to defaults
    /// for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value source (the environment, in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("HUBSTREAM_CONSUMER_GROUP") {
            config.consumer_group = v.parse().map_err(|e: hubstream_core::ReceiveError| {
                ConfigError::Parse {
                    key: "HUBSTREAM_CONSUMER_GROUP".to_string(),
                    value: v.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(v) = parse_var(&lookup, "HUBSTREAM_PREFETCH")? {
            config.prefetch = v as usize;
        }
        if let Some(v) = parse_var(&lookup, "HUBSTREAM_MAX_BATCH_SIZE")? {
            config.max_batch_size = v as usize;
        }
        if let Some(v) = parse_var(&lookup, "HUBSTREAM_OPEN_TIMEOUT_MS")? {
            config.open_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "HUBSTREAM_RECEIVE_TIMEOUT_MS")? {
            config.default_receive_timeout = Duration::from_millis(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document (unset fields take defaults).
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(document).map_err(|e| ConfigError::Document(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch == 0 {
            return Err(ConfigError::Invalid("prefetch must be at least 1".to_string()));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_consumer_group(mut self, group: ConsumerGroup) -> Self {
        self.consumer_group = group;
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.default_receive_timeout = timeout;
        self
    }
}

/// Per-receiver overrides of [`ClientConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverOptions {
    pub prefetch: Option<usize>,
    pub max_batch_size: Option<usize>,
    pub open_timeout: Option<Duration>,
}

impl ReceiverOptions {
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = Some(max);
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Some(timeout);
        self
    }
}

/// Settings a receiver actually runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedOptions {
    pub prefetch: usize,
    pub max_batch_size: usize,
    pub open_timeout: Duration,
    pub receive_timeout: Duration,
}

impl ResolvedOptions {
    pub fn merge(config: &ClientConfig, options: &ReceiverOptions) -> Result<Self, ConfigError> {
        let resolved = Self {
            prefetch: options.prefetch.unwrap_or(config.prefetch),
            max_batch_size: options.max_batch_size.unwrap_or(config.max_batch_size),
            open_timeout: options.open_timeout.unwrap_or(config.open_timeout),
            receive_timeout: config.default_receive_timeout,
        };
        if resolved.prefetch == 0 || resolved.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "prefetch and max_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(resolved)
    }
}

fn parse_var(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, ConfigError> {
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<u64>().map_err(|e| ConfigError::Parse {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
