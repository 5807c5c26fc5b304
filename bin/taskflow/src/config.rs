//! CLI configuration.
//!
//! Loaded via the `config` crate from an optional `taskflow.toml` in the
//! working directory, overridden by `TASKFLOW__*` environment variables
//! (`TASKFLOW__ENGINE__MAX_SUBPROCESS_DEPTH=4`).

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use taskflow_scheduler::SchedulerConfig;
use taskflow_workflow::EngineConfig;

/// Configuration composed from library configs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskflowConfig {
    /// Execution engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Trigger manager configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// How often `run` polls the execution monitor, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl TaskflowConfig {
    /// Loads configuration from `file` (if present) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source is malformed.
    pub fn load(file: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(file).required(false))
            .add_source(
                config::Environment::with_prefix("TASKFLOW")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let config = TaskflowConfig::load(Path::new("does-not-exist.toml")).unwrap();
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn nested_sections_deserialize() {
        let config: TaskflowConfig = serde_json::from_value(serde_json::json!({
            "engine": { "max_subprocess_depth": 2 },
            "scheduler": { "max_consecutive_failures": 1 },
        }))
        .unwrap();
        assert_eq!(config.engine.max_subprocess_depth, 2);
        assert_eq!(config.engine.max_steps_per_transition, 10_000);
        assert_eq!(config.scheduler.max_consecutive_failures, 1);
        assert_eq!(config.poll_interval_ms, 100);
    }
}
