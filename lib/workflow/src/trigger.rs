//! Trigger definitions.
//!
//! Triggers belong to a workflow definition and describe when the trigger
//! manager should start a new execution. This module only holds the data;
//! firing lives in the scheduler crate.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use taskflow_core::TriggerId;

/// The kind of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fires only on an explicit "execute now" call.
    Manual,
    /// Fires on a recurrence.
    Schedule,
    /// Fires when a named event is published.
    Event,
    /// Fires when a polled predicate turns true.
    Condition,
}

/// How often a schedule recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "every", rename_all = "snake_case")]
pub enum Frequency {
    /// Every day.
    Daily,
    /// Every week on the given weekday.
    Weekly { weekday: Weekday },
    /// Every month on the given day, clamped to the month's length.
    Monthly { day: u32 },
}

/// A recurrence: a frequency plus a UTC time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    /// How often.
    #[serde(flatten)]
    pub frequency: Frequency,
    /// Time of day (UTC).
    pub at: NaiveTime,
}

impl Recurrence {
    /// Daily at the given time.
    #[must_use]
    pub fn daily(at: NaiveTime) -> Self {
        Self {
            frequency: Frequency::Daily,
            at,
        }
    }

    /// Weekly on `weekday` at the given time.
    #[must_use]
    pub fn weekly(weekday: Weekday, at: NaiveTime) -> Self {
        Self {
            frequency: Frequency::Weekly { weekday },
            at,
        }
    }

    /// Monthly on `day` at the given time.
    #[must_use]
    pub fn monthly(day: u32, at: NaiveTime) -> Self {
        Self {
            frequency: Frequency::Monthly { day },
            at,
        }
    }
}

/// Configuration for a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Manual trigger.
    Manual,
    /// Recurring schedule.
    Schedule {
        /// When the trigger fires.
        recurrence: Recurrence,
    },
    /// Named event channel.
    Event {
        /// Event name to subscribe to.
        event: String,
    },
    /// Polled predicate, edge-triggered on false to true.
    Condition {
        /// Predicate understood by the predicate evaluator.
        predicate: String,
        /// Poll interval in seconds; falls back to the scheduler default.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval_secs: Option<u64>,
    },
}

/// A trigger attached to a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Unique identifier.
    #[serde(default)]
    pub id: TriggerId,
    /// Trigger configuration.
    #[serde(flatten)]
    pub config: TriggerConfig,
    /// Whether this trigger may fire.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// When this trigger was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When this trigger was last updated.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl Trigger {
    /// Creates a new, enabled trigger.
    #[must_use]
    pub fn new(config: TriggerConfig) -> Self {
        let now = Utc::now();
        Self {
            id: TriggerId::new(),
            config,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the trigger kind.
    #[must_use]
    pub fn kind(&self) -> TriggerKind {
        match &self.config {
            TriggerConfig::Manual => TriggerKind::Manual,
            TriggerConfig::Schedule { .. } => TriggerKind::Schedule,
            TriggerConfig::Event { .. } => TriggerKind::Event,
            TriggerConfig::Condition { .. } => TriggerKind::Condition,
        }
    }

    /// Enables this trigger.
    pub fn enable(&mut self) {
        self.enabled = true;
        self.updated_at = Utc::now();
    }

    /// Disables this trigger.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_trigger_creation() {
        let at = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let trigger = Trigger::new(TriggerConfig::Schedule {
            recurrence: Recurrence::daily(at),
        });
        assert_eq!(trigger.kind(), TriggerKind::Schedule);
        assert!(trigger.enabled);
    }

    #[test]
    fn trigger_enable_disable() {
        let mut trigger = Trigger::new(TriggerConfig::Manual);
        trigger.disable();
        assert!(!trigger.enabled);
        trigger.enable();
        assert!(trigger.enabled);
    }

    #[test]
    fn recurrence_json_shape() {
        let json = serde_json::json!({
            "kind": "schedule",
            "recurrence": { "every": "weekly", "weekday": "Mon", "at": "09:30:00" }
        });
        let trigger: Trigger = serde_json::from_value(json).expect("deserialize");
        match trigger.config {
            TriggerConfig::Schedule { recurrence } => {
                assert_eq!(recurrence.frequency, Frequency::Weekly { weekday: Weekday::Mon });
                assert_eq!(recurrence.at, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
            }
            other => panic!("unexpected config: {other:?}"),
        }
        assert!(trigger.enabled);
    }
}
