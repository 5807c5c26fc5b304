//! Engine configuration.

use crate::node::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Execution engine configuration.
///
/// Fields with defaults can be omitted when loading from a file or the
/// environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum instance duration in seconds for definitions that do not set
    /// their own. Unset means no limit.
    #[serde(default)]
    pub default_max_duration_secs: Option<u64>,

    /// Maximum nesting depth of subprocess executions.
    #[serde(default = "default_max_subprocess_depth")]
    pub max_subprocess_depth: u32,

    /// Maximum number of steps a single transition may process.
    /// Guards against loops that never suspend.
    #[serde(default = "default_max_steps_per_transition")]
    pub max_steps_per_transition: usize,

    /// Retry policy for task nodes that do not declare one.
    #[serde(default)]
    pub default_retry: Option<RetryPolicy>,
}

fn default_max_subprocess_depth() -> u32 {
    8
}

fn default_max_steps_per_transition() -> usize {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_duration_secs: None,
            max_subprocess_depth: default_max_subprocess_depth(),
            max_steps_per_transition: default_max_steps_per_transition(),
            default_retry: None,
        }
    }
}

impl EngineConfig {
    /// Returns the default maximum duration.
    #[must_use]
    pub fn default_max_duration(&self) -> Option<Duration> {
        self.default_max_duration_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_has_correct_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_max_duration(), None);
        assert_eq!(config.max_subprocess_depth, 8);
        assert_eq!(config.max_steps_per_transition, 10_000);
        assert!(config.default_retry.is_none());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_subprocess_depth": 2}"#).expect("deserialize");
        assert_eq!(config.max_subprocess_depth, 2);
        assert_eq!(config.max_steps_per_transition, 10_000);
    }
}
