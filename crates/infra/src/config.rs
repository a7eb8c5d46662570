//! Configuration loading and representation.
//!
//! Two layers:
//! - queue settings persisted in the store's `config` table (shared by every
//!   process using the same database)
//! - process settings read from the environment (database location)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use queuectl_core::{BackoffPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES};

/// Environment variable holding the database path.
pub const DB_PATH_ENV: &str = "QUEUECTL_DB";

/// Database file used when neither `--db` nor `QUEUECTL_DB` is given.
pub const DEFAULT_DB_PATH: &str = "queue.db";

/// `config` table key of the cross-process worker stop flag.
pub const STOP_FLAG_KEY: &str = "workers_stop";

/// Resolve the database path from `QUEUECTL_DB`, falling back to `queue.db`.
pub fn database_path_from_env() -> PathBuf {
    match std::env::var(DB_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_DB_PATH),
    }
}

/// Keys of the persisted queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    BackoffBase,
    BackoffUnitMs,
    MaxRetries,
}

impl SettingKey {
    pub const ALL: [SettingKey; 3] = [
        SettingKey::BackoffBase,
        SettingKey::BackoffUnitMs,
        SettingKey::MaxRetries,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::BackoffBase => "backoff_base",
            SettingKey::BackoffUnitMs => "backoff_unit_ms",
            SettingKey::MaxRetries => "max_retries",
        }
    }
}

impl core::fmt::Display for SettingKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| SettingsError::UnknownKey(s.to_string()))
    }
}

/// Settings error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("unknown setting: {0}")]
    UnknownKey(String),
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: SettingKey,
        value: String,
        reason: String,
    },
}

/// Queue-wide defaults stored in the `config` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSettings {
    /// Exponent base of the retry backoff (> 1)
    pub backoff_base: u32,
    /// Milliseconds per backoff unit (1000 = delays in seconds)
    pub backoff_unit_ms: u64,
    /// Retry budget for jobs enqueued without `max_retries`
    pub max_retries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_unit_ms: 1_000,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl QueueSettings {
    /// Backoff policy described by these settings.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, Duration::from_millis(self.backoff_unit_ms))
            .unwrap_or_default()
    }

    pub fn get(&self, key: SettingKey) -> String {
        match key {
            SettingKey::BackoffBase => self.backoff_base.to_string(),
            SettingKey::BackoffUnitMs => self.backoff_unit_ms.to_string(),
            SettingKey::MaxRetries => self.max_retries.to_string(),
        }
    }

    /// Validate and apply one textual value.
    pub fn apply(&mut self, key: SettingKey, value: &str) -> Result<(), SettingsError> {
        let invalid = |reason: String| SettingsError::InvalidValue {
            key,
            value: value.to_string(),
            reason,
        };
        let trimmed = value.trim();
        match key {
            SettingKey::BackoffBase => {
                let base: u32 = trimmed.parse().map_err(|e| invalid(format!("{e}")))?;
                if base < 2 {
                    return Err(invalid("must be greater than 1".to_string()));
                }
                self.backoff_base = base;
            }
            SettingKey::BackoffUnitMs => {
                let unit: u64 = trimmed.parse().map_err(|e| invalid(format!("{e}")))?;
                if unit == 0 {
                    return Err(invalid("must be non-zero".to_string()));
                }
                self.backoff_unit_ms = unit;
            }
            SettingKey::MaxRetries => {
                self.max_retries = trimmed.parse().map_err(|e| invalid(format!("{e}")))?;
            }
        }
        Ok(())
    }

    /// Build settings from stored `(key, value)` rows. Keys that are not
    /// settings (e.g. the stop flag) are skipped; missing keys keep defaults.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, SettingsError> {
        let mut settings = Self::default();
        for (key, value) in pairs {
            if let Ok(key) = key.parse::<SettingKey>() {
                settings.apply(key, value)?;
            }
        }
        Ok(settings)
    }

    pub fn to_pairs(&self) -> Vec<(SettingKey, String)> {
        SettingKey::ALL.into_iter().map(|k| (k, self.get(k))).collect()
    }
}
