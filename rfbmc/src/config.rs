//! Configuration for store controllers and backends.
//!
//! Every field has a default, so an empty JSON object (`{}`) is a valid
//! configuration. Values are checked by [`StoreConfig::validate`] before use.
//!
//! ```rust
//! use rfbmc::config::StoreConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config: StoreConfig = serde_json::from_str(r#"{ "max_create_attempts": 16 }"#)?;
//! config.validate()?;
//! assert_eq!(config.max_create_attempts, Some(16));
//! assert_eq!(config.retry.max_retries, 100);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Top-level configuration shared by [`crate::store::RfBmcStore`] and the
/// backends that need tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backoff policy for the compare-and-swap emulation.
    pub retry: RetryConfig,

    /// Cap on identifier generation attempts in `create`.
    ///
    /// `None` keeps generating until a fresh identifier is found. Collisions
    /// of random 128-bit identifiers are not expected in practice.
    pub max_create_attempts: Option<u32>,

    /// How many load/migrate rounds `load_and_normalize` may run before
    /// giving up on a store that keeps changing format underneath it.
    pub max_migration_attempts: u32,

    /// How long a [`crate::backend::dir::DirStore`] waits for an entry lock.
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            max_create_attempts: None,
            max_migration_attempts: 8,
            lock_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    /// Loads and validates a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Read`] if the file cannot be read
    /// - [`ConfigError::Parse`] if the file is not valid JSON
    /// - [`ConfigError::Invalid`] if a value is out of range
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;

        if self.max_create_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_create_attempts",
                reason: "must be > 0 when set".to_string(),
            }
            .into());
        }

        if self.max_migration_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_migration_attempts",
                reason: "must be > 0".to_string(),
            }
            .into());
        }

        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "lock_timeout_ms",
                reason: "must be > 0".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Returns the lock timeout as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Exponential backoff with jitter for optimistic retry loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum compare-and-swap attempts before reporting contention.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay between retries, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 100,  // many retries for hot entries
            initial_backoff_ms: 1,
            max_backoff_ms: 64,
        }
    }
}

impl RetryConfig {
    /// Validates the retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the policy can never make progress.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_retries",
                reason: "must be > 0".to_string(),
            }
            .into());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Invalid {
                field: "retry.initial_backoff_ms",
                reason: format!(
                    "initial backoff {}ms exceeds max backoff {}ms",
                    self.initial_backoff_ms, self.max_backoff_ms
                ),
            }
            .into());
        }
        Ok(())
    }

    /// Returns the backoff that follows `current_ms`, capped at the maximum.
    pub fn next_backoff_ms(&self, current_ms: u64) -> u64 {
        current_ms.saturating_mul(2).max(1).min(self.max_backoff_ms)
    }
}
