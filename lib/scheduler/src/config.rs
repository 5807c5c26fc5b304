//! Trigger manager configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Trigger manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Consecutive evaluation failures after which a trigger is disabled.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Poll interval in seconds for condition triggers that do not set one.
    #[serde(default = "default_poll_interval_secs")]
    pub default_poll_interval_secs: u64,
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            default_poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn default_poll_interval(&self) -> Duration {
        Duration::from_secs(self.default_poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_consecutive_failures, 5);
        assert_eq!(config.default_poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn missing_fields_use_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{ "max_consecutive_failures": 2 }"#).unwrap();
        assert_eq!(config.max_consecutive_failures, 2);
        assert_eq!(config.default_poll_interval_secs, 30);
    }
}
