//! Predicates polled by condition triggers.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use taskflow_workflow::condition::Condition;
use tokio::sync::RwLock;

/// Evaluates a condition trigger's predicate.
#[async_trait]
pub trait ConditionPredicate: Send + Sync {
    /// Returns whether the predicate currently holds.
    ///
    /// # Errors
    ///
    /// Returns a description of why the predicate could not be evaluated.
    async fn evaluate(&self, predicate: &str) -> Result<bool, String>;

    /// Checks a predicate at registration time.
    ///
    /// # Errors
    ///
    /// Returns a description of why the predicate is malformed.
    fn check(&self, predicate: &str) -> Result<(), String> {
        if predicate.trim().is_empty() {
            return Err("empty predicate".to_string());
        }
        Ok(())
    }
}

/// Evaluates predicates as condition expressions over a shared JSON state.
///
/// Whoever owns the state updates it with [`StatePredicate::set`] or
/// [`StatePredicate::update`].
#[derive(Debug, Default)]
pub struct StatePredicate {
    state: RwLock<JsonValue>,
}

impl StatePredicate {
    #[must_use]
    pub fn new(state: JsonValue) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Replaces the state.
    pub async fn set(&self, state: JsonValue) {
        *self.state.write().await = state;
    }

    /// Modifies the state in place.
    pub async fn update(&self, change: impl FnOnce(&mut JsonValue)) {
        change(&mut *self.state.write().await);
    }
}

#[async_trait]
impl ConditionPredicate for StatePredicate {
    async fn evaluate(&self, predicate: &str) -> Result<bool, String> {
        let state = self.state.read().await;
        Condition::new(predicate)
            .evaluate(&state)
            .map_err(|error| error.to_string())
    }

    fn check(&self, predicate: &str) -> Result<(), String> {
        Condition::new(predicate)
            .check()
            .map_err(|error| error.to_string())
    }
}
