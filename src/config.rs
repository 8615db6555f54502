use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Capacity of the broadcast channel carrying install updates to subscribers.
pub const DEFAULT_UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Events held per unknown session id while a submission is still in flight.
pub const DEFAULT_EARLY_EVENT_BUFFER: usize = 16;

/// Linear backoff step between ServiceDied resubmissions (500 ms).
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Policy for automatic resubmission after the backend service dies.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum resubmissions per logical request; `None` retries forever.
    pub max_retries: Option<u32>,
    /// Attempt `n` waits `n * backoff_ms` before resubmitting.
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Whether the given 1-based attempt number may still be issued.
    pub fn allows(&self, attempt: u32) -> bool {
        match self.max_retries {
            Some(max) => attempt <= max,
            None => true,
        }
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(attempt as u64))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

/// Top-level configuration for the install manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Capacity of the install update broadcast channel.
    pub update_channel_capacity: usize,
    /// Events buffered per unknown session id during an in-flight submission.
    pub early_event_buffer: usize,
    /// Run the conflict policy when the backend reports too many active sessions.
    pub resolve_conflicts_on_limit: bool,
    /// Resubmission policy for ServiceDied failures.
    pub service_died_retry: RetryPolicy,
}

impl ManagerConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("invalid install manager config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json_str(&raw)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            update_channel_capacity: DEFAULT_UPDATE_CHANNEL_CAPACITY,
            early_event_buffer: DEFAULT_EARLY_EVENT_BUFFER,
            resolve_conflicts_on_limit: true,
            service_died_retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            ManagerConfig::from_json_str(r#"{"service_died_retry": {"max_retries": 3}}"#).unwrap();
        assert_eq!(config.service_died_retry.max_retries, Some(3));
        assert_eq!(config.service_died_retry.backoff_ms, DEFAULT_RETRY_BACKOFF_MS);
        assert_eq!(config.update_channel_capacity, DEFAULT_UPDATE_CHANNEL_CAPACITY);
        assert!(config.resolve_conflicts_on_limit);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("install.json");
        std::fs::write(&path, r#"{"early_event_buffer": 4, "resolve_conflicts_on_limit": false}"#)
            .unwrap();

        let config = ManagerConfig::load(&path).unwrap();
        assert_eq!(config.early_event_buffer, 4);
        assert!(!config.resolve_conflicts_on_limit);
        assert!(ManagerConfig::load(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_retry_policy() {
        let unbounded = RetryPolicy::unbounded();
        assert!(unbounded.allows(10_000));
        assert_eq!(unbounded.backoff_for(2), Duration::from_millis(1000));

        let capped = RetryPolicy {
            max_retries: Some(2),
            backoff_ms: 0,
        };
        assert!(capped.allows(2));
        assert!(!capped.allows(3));
        assert_eq!(capped.backoff_for(5), Duration::ZERO);
    }
}
