use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ingest::DEFAULT_LOG_CAPACITY;

const MIN_POLL_INTERVAL_MS: u64 = 50;

/// Tuning knobs for one monitor instance. Every field has a default so a
/// partial `[monitor]` table is enough.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub stop_timeout_ms: u64,
    pub log_capacity: usize,
    pub view_log_tail: usize,
    pub command_queue_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            stop_timeout_ms: 10_000,
            log_capacity: DEFAULT_LOG_CAPACITY,
            view_log_tail: 200,
            command_queue_capacity: 64,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_table_keeps_defaults() {
        let config: MonitorConfig =
            serde_json::from_str(r#"{"poll_interval_ms": 500}"#).expect("config");
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.stop_timeout(), Duration::from_secs(10));
        assert_eq!(config.log_capacity, DEFAULT_LOG_CAPACITY);
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let config = MonitorConfig {
            poll_interval_ms: 0,
            ..MonitorConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
    }
}
