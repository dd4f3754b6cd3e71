//! Tunables shared by the coordinator and client sessions.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const DEFAULT_SEND_SETTINGS_DELAY_MS: u64 = 2_000;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;
const DEFAULT_LOCK_WINDOW_SECS: u64 = 150;
const DEFAULT_CAPABILITY: &str = "customize";
const DEFAULT_PULL_LIMIT: usize = 100;
const DEFAULT_SUBMIT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    /// Debounce interval between the last local edit and the preview push.
    pub send_settings_delay_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// Age after which an uncorroborated preview stops locking the setting.
    pub lock_window_secs: u64,
    /// Capability a user needs to preview or publish.
    pub capability: String,
    pub pull_limit: usize,
    pub submit_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            send_settings_delay_ms: DEFAULT_SEND_SETTINGS_DELAY_MS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            lock_window_secs: DEFAULT_LOCK_WINDOW_SECS,
            capability: DEFAULT_CAPABILITY.to_string(),
            pull_limit: DEFAULT_PULL_LIMIT,
            submit_timeout_ms: DEFAULT_SUBMIT_TIMEOUT_MS,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON document; absent fields keep their defaults.
    pub fn from_json_str(payload: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(payload)
            .map_err(|e| CoreError::InvalidConfig(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.send_settings_delay_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "send_settings_delay_ms must be positive".into(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.lock_window_secs == 0 {
            return Err(CoreError::InvalidConfig(
                "lock_window_secs must be positive".into(),
            ));
        }
        if self.capability.trim().is_empty() {
            return Err(CoreError::InvalidConfig("capability must not be empty".into()));
        }
        if self.pull_limit == 0 {
            return Err(CoreError::InvalidConfig("pull_limit must be positive".into()));
        }
        if self.submit_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "submit_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_window_ms(&self) -> u64 {
        self.lock_window_secs.saturating_mul(1_000)
    }

    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_secs.saturating_mul(1_000)
    }
}
