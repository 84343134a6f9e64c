//! Runtime configuration.

use std::time::Duration;

use mdk_discovery::ClientOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("Invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
}

/// MDK runtime configuration.
///
/// Every field has a default; `from_env` and `from_json` override only what
/// they are given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MdkConfig {
    /// Bound on a single uplink connect attempt (seconds).
    pub connect_timeout_secs: f64,
    /// Connect attempts made by `Mdk::start` before failing.
    pub connect_attempts: u32,
    /// Initial reconnect backoff (milliseconds); doubles per attempt.
    pub reconnect_backoff_ms: u64,
    /// Reconnect backoff ceiling (milliseconds).
    pub reconnect_backoff_max_ms: u64,
    /// Timeout used by `Session::resolve_default` (seconds).
    pub default_timeout_secs: f64,
    /// Seed for node selection. `None` seeds from entropy.
    pub selection_seed: Option<u64>,
}

impl Default for MdkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10.0,
            connect_attempts: 3,
            reconnect_backoff_ms: 250,
            reconnect_backoff_max_ms: 8_000,
            default_timeout_secs: 10.0,
            selection_seed: None,
        }
    }
}

impl MdkConfig {
    /// Defaults overridden by `MDK_*` environment variables.
    ///
    /// # Errors
    /// Returns error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by values from `lookup`, keyed by variable name.
    ///
    /// # Errors
    /// Returns error if a value is unparseable or out of range.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = parse(&lookup, "MDK_CONNECT_TIMEOUT")? {
            config.connect_timeout_secs = v;
        }
        if let Some(v) = parse(&lookup, "MDK_CONNECT_ATTEMPTS")? {
            config.connect_attempts = v;
        }
        if let Some(v) = parse(&lookup, "MDK_RECONNECT_BACKOFF_MS")? {
            config.reconnect_backoff_ms = v;
        }
        if let Some(v) = parse(&lookup, "MDK_RECONNECT_BACKOFF_MAX_MS")? {
            config.reconnect_backoff_max_ms = v;
        }
        if let Some(v) = parse(&lookup, "MDK_TIMEOUT")? {
            config.default_timeout_secs = v;
        }
        if let Some(v) = parse(&lookup, "MDK_SELECTION_SEED")? {
            config.selection_seed = Some(v);
        }
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by a JSON document.
    ///
    /// # Errors
    /// Returns error if the document is malformed or a value is out of range.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        secs(self.default_timeout_secs)
    }

    /// Uplink client tuning derived from this configuration.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout: self.connect_timeout(),
            connect_attempts: self.connect_attempts.max(1),
            backoff: Duration::from_millis(self.reconnect_backoff_ms),
            backoff_max: Duration::from_millis(self.reconnect_backoff_max_ms),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_secs("MDK_CONNECT_TIMEOUT", self.connect_timeout_secs)?;
        check_secs("MDK_TIMEOUT", self.default_timeout_secs)?;
        if self.connect_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "MDK_CONNECT_ATTEMPTS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

fn check_secs(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        return Ok(());
    }
    Err(ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: "must be a non-negative number of seconds".to_string(),
    })
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}
