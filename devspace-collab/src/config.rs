//! Session tuning knobs.
//!
//! All durations are stored as milliseconds so the struct can be embedded
//! directly in an application's JSON settings; missing fields fall back to
//! the defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Timeouts, backoff and buffering bounds for one collaboration session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Silence after which a ping is sent.
    pub heartbeat_interval_ms: u64,
    /// Silence after which the connection is considered dead.
    pub heartbeat_timeout_ms: u64,
    /// First reconnect delay; doubled on every failed attempt.
    pub backoff_base_ms: u64,
    /// Ceiling for the reconnect delay.
    pub backoff_max_ms: u64,
    /// How long to wait for a sync response before going live alone.
    pub sync_timeout_ms: u64,
    /// Period of the local awareness refresh.
    pub awareness_refresh_interval_ms: u64,
    /// Age after which a silent peer's awareness record is evicted.
    pub awareness_timeout_ms: u64,
    /// How long an operation may wait for its causal dependency.
    pub causal_gap_timeout_ms: u64,
    /// Maximum number of buffered operations before declaring a desync.
    pub max_pending_operations: usize,
    /// Operations merged per driver step before yielding.
    pub merge_chunk_size: usize,
    /// Driver clock resolution.
    pub tick_interval_ms: u64,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            backoff_base_ms: 250,
            backoff_max_ms: 30_000,
            sync_timeout_ms: 2_000,
            awareness_refresh_interval_ms: 15_000,
            awareness_timeout_ms: 30_000,
            causal_gap_timeout_ms: 10_000,
            max_pending_operations: 10_000,
            merge_chunk_size: 512,
            tick_interval_ms: 250,
        }
    }
}

impl CollabConfig {
    /// Parse from JSON, filling unspecified fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make the state machines misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.awareness_timeout_ms <= self.awareness_refresh_interval_ms {
            return Err(ConfigError::Invalid(
                "awareness_timeout_ms must exceed awareness_refresh_interval_ms".into(),
            ));
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "backoff_base_ms must be non-zero and at most backoff_max_ms".into(),
            ));
        }
        if self.merge_chunk_size == 0 || self.max_pending_operations == 0 {
            return Err(ConfigError::Invalid(
                "merge_chunk_size and max_pending_operations must be non-zero".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn awareness_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.awareness_refresh_interval_ms)
    }

    pub fn awareness_timeout(&self) -> Duration {
        Duration::from_millis(self.awareness_timeout_ms)
    }

    pub fn causal_gap_timeout(&self) -> Duration {
        Duration::from_millis(self.causal_gap_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CollabConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_json_partial_uses_defaults() {
        let config = CollabConfig::from_json(r#"{ "backoff_base_ms": 100 }"#).unwrap();
        assert_eq!(config.backoff_base(), Duration::from_millis(100));
        assert_eq!(config.merge_chunk_size, CollabConfig::default().merge_chunk_size);
    }

    #[test]
    fn test_from_json_rejects_inverted_awareness_timeout() {
        let json = r#"{ "awareness_refresh_interval_ms": 5000, "awareness_timeout_ms": 1000 }"#;
        assert!(matches!(
            CollabConfig::from_json(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            CollabConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
