//! Config - 実行時設定
//!
//! JSON ファイルから読み込み、足りない項目はデフォルトで埋めます。
//! 数値は秒 / ミリ秒の整数で持ち、`Duration` アクセサで変換します。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::blocker::BlockerLimits;
use crate::domain::{ConfigError, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    /// Upper bound on live worker slots.
    pub max_slots: usize,
    /// Failures allowed before a task is marked failed.
    pub max_retries: u32,
    /// PENDING blockers older than this are expired.
    pub blocker_timeout_secs: u64,
    pub expiry_sweep_interval_secs: u64,
    /// How often a suspended worker re-checks its blocker.
    pub poll_interval_ms: u64,
    pub schedule_interval_ms: u64,
    pub question_max_len: usize,
    pub answer_max_len: usize,
    pub blocker_rate_limit_per_minute: u32,
    /// Turn failures that read like a request for human input into SYNC blockers.
    pub escalate_human_failures: bool,
    /// Push channel capacity; slower observers resync from a snapshot.
    pub event_buffer: usize,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            max_slots: 10,
            max_retries: 3,
            blocker_timeout_secs: 24 * 60 * 60,
            expiry_sweep_interval_secs: 60 * 60,
            poll_interval_ms: 10_000,
            schedule_interval_ms: 1_000,
            question_max_len: 2_000,
            answer_max_len: 5_000,
            blocker_rate_limit_per_minute: 10,
            escalate_human_failures: false,
            event_buffer: 256,
        }
    }
}

impl ForemanConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.max_slots > 0, "max_slots must be > 0"),
            (self.max_retries > 0, "max_retries must be > 0"),
            (self.blocker_timeout_secs > 0, "blocker_timeout_secs must be > 0"),
            (self.expiry_sweep_interval_secs > 0, "expiry_sweep_interval_secs must be > 0"),
            (self.poll_interval_ms > 0, "poll_interval_ms must be > 0"),
            (self.schedule_interval_ms > 0, "schedule_interval_ms must be > 0"),
            (self.question_max_len > 0, "question_max_len must be > 0"),
            (self.answer_max_len > 0, "answer_max_len must be > 0"),
            (self.blocker_rate_limit_per_minute > 0, "blocker_rate_limit_per_minute must be > 0"),
            (self.event_buffer > 0, "event_buffer must be > 0"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(ConfigError::Invalid((*message).to_string())),
            None => Ok(()),
        }
    }

    pub fn blocker_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.blocker_timeout_secs.min(i64::MAX as u64) as i64)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
        }
    }

    pub fn blocker_limits(&self) -> BlockerLimits {
        BlockerLimits {
            question_max_len: self.question_max_len,
            answer_max_len: self.answer_max_len,
            rate_limit_per_minute: self.blocker_rate_limit_per_minute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = ForemanConfig::from_json_str(r#"{"max_slots": 2}"#).unwrap();
        assert_eq!(config.max_slots, 2);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.blocker_timeout(), chrono::Duration::hours(24));
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
    }

    #[test]
    fn zero_slots_is_invalid() {
        let err = ForemanConfig::from_json_str(r#"{"max_slots": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("max_slots")));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            ForemanConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ForemanConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { ref path, .. } if path.contains("not/here")));
    }
}
