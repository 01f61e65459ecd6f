//! Declared configuration schema and the typed snapshot consumed by the
//! engine.
//!
//! Values are stored as strings in the `config` table and typed at read
//! time according to the key's parse rule. `set` rejects unknown keys and
//! values that fail the rule, so the table can never hold an unreadable
//! snapshot.

use std::collections::HashMap;

use crate::error::{QueueError, Result};

/// Default location of the embedded database.
pub const DEFAULT_DB_PATH: &str = ".data/queuectl.db";

/// Environment variable overriding the bootstrap database location.
pub const ENV_DB_PATH: &str = "QUEUECTL_DB";

/// PID file written by the foreground supervisor.
pub const WORKER_PID_FILE: &str = ".data/queuectl_workers.pid";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseRule {
    /// Integer >= 0.
    NonNegativeInt,
    /// Integer >= 1.
    PositiveInt,
    /// Non-empty string.
    NonEmpty,
}

#[derive(Debug, Clone, Copy)]
pub struct ConfigKey {
    pub name: &'static str,
    pub default: &'static str,
    rule: ParseRule,
}

/// Recognized configuration keys. `config set` rejects anything else.
pub const CONFIG_KEYS: &[ConfigKey] = &[
    ConfigKey {
        name: "max_retries",
        default: "3",
        rule: ParseRule::NonNegativeInt,
    },
    ConfigKey {
        name: "backoff_base",
        default: "2",
        rule: ParseRule::PositiveInt,
    },
    ConfigKey {
        name: "poll_interval_ms",
        default: "500",
        rule: ParseRule::PositiveInt,
    },
    ConfigKey {
        name: "db_path",
        default: DEFAULT_DB_PATH,
        rule: ParseRule::NonEmpty,
    },
    ConfigKey {
        name: "worker_heartbeat_interval_seconds",
        default: "5",
        rule: ParseRule::PositiveInt,
    },
    ConfigKey {
        name: "stale_worker_timeout_seconds",
        default: "30",
        rule: ParseRule::PositiveInt,
    },
];

pub fn lookup_key(name: &str) -> Result<&'static ConfigKey> {
    CONFIG_KEYS
        .iter()
        .find(|k| k.name == name)
        .ok_or_else(|| {
            QueueError::Validation(format!(
                "unknown config key '{}'. known keys: {}",
                name,
                CONFIG_KEYS
                    .iter()
                    .map(|k| k.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
}

/// Validate a value against the key's parse rule before it is persisted.
pub fn validate_value(name: &str, value: &str) -> Result<()> {
    let key = lookup_key(name)?;
    match key.rule {
        ParseRule::NonNegativeInt => {
            value.trim().parse::<u64>().map_err(|_| {
                QueueError::Validation(format!(
                    "invalid value '{}' for '{}': expected a non-negative integer",
                    value, name
                ))
            })?;
        }
        ParseRule::PositiveInt => {
            let parsed = value.trim().parse::<u64>().map_err(|_| {
                QueueError::Validation(format!(
                    "invalid value '{}' for '{}': expected a positive integer",
                    value, name
                ))
            })?;
            if parsed == 0 {
                return Err(QueueError::Validation(format!(
                    "invalid value '0' for '{}': expected a positive integer",
                    name
                )));
            }
        }
        ParseRule::NonEmpty => {
            if value.trim().is_empty() {
                return Err(QueueError::Validation(format!(
                    "invalid empty value for '{}'",
                    name
                )));
            }
        }
    }
    Ok(())
}

/// Typed configuration snapshot: declared defaults merged with stored
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_retries: u32,
    pub backoff_base: u32,
    pub poll_interval_ms: u64,
    pub db_path: String,
    pub worker_heartbeat_interval_seconds: u64,
    pub stale_worker_timeout_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_retries: 3,
            backoff_base: 2,
            poll_interval_ms: 500,
            db_path: DEFAULT_DB_PATH.to_string(),
            worker_heartbeat_interval_seconds: 5,
            stale_worker_timeout_seconds: 30,
        }
    }
}

impl QueueConfig {
    pub fn from_entries(stored: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| -> String {
            stored
                .get(name)
                .cloned()
                .unwrap_or_else(|| lookup_key(name).expect("declared key").default.to_string())
        };
        let int = |name: &str| -> Result<u64> {
            let raw = get(name);
            raw.trim().parse::<u64>().map_err(|_| {
                QueueError::Store(format!(
                    "stored config value '{}' for '{}' is not an integer",
                    raw, name
                ))
            })
        };
        Ok(QueueConfig {
            max_retries: int("max_retries")? as u32,
            backoff_base: int("backoff_base")? as u32,
            poll_interval_ms: int("poll_interval_ms")?,
            db_path: get("db_path"),
            worker_heartbeat_interval_seconds: int("worker_heartbeat_interval_seconds")?,
            stale_worker_timeout_seconds: int("stale_worker_timeout_seconds")?,
        })
    }

    /// Effective key/value listing: defaults overlaid with stored entries.
    pub fn effective_entries(stored: &HashMap<String, String>) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = CONFIG_KEYS
            .iter()
            .map(|k| {
                let value = stored
                    .get(k.name)
                    .cloned()
                    .unwrap_or_else(|| k.default.to_string());
                (k.name.to_string(), value)
            })
            .collect();
        out.sort();
        out
    }
}

/// Bootstrap database location: `QUEUECTL_DB` when set, otherwise the
/// default path. The stored `db_path` key may redirect from there.
pub fn bootstrap_db_path() -> String {
    std::env::var(ENV_DB_PATH)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_DB_PATH.to_string())
}
