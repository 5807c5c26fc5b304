//! Rule engine: the side-effect policy layer.
//!
//! Instance actors offer each appended log entry to the rule engine, which
//! runs as its own task. For every entry the enabled rules of the
//! definition are evaluated in priority order (high, medium, low; ties keep
//! declaration order) and the first match fires. Outcomes that concern the
//! instance itself are sent back to its actor as messages.

use crate::definition::WorkflowDefinition;
use crate::execution::ExecutionLogEntry;
use crate::instance::InstanceMessage;
use crate::rule::{Rule, RuleAction, ValidationOutcome};
use crate::services::{Escalation, NewTask, NotificationSender, TaskStore};
use crate::template;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use taskflow_core::ExecutionId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What a fired rule asks of the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// A validation rule failed the execution.
    Reject { rule: String, reason: String },
    /// A validation rule asked for a warning entry.
    Warn { rule: String, message: String },
    /// The rule's action could not be carried out.
    ActionFailed { rule: String, reason: String },
}

/// A log entry offered to the rule engine.
#[derive(Debug)]
pub(crate) struct RuleEvent {
    pub execution_id: ExecutionId,
    pub definition: Arc<WorkflowDefinition>,
    pub entry: ExecutionLogEntry,
    pub context: JsonValue,
    pub reply: mpsc::UnboundedSender<InstanceMessage>,
}

/// Sending half of a running rule engine.
#[derive(Debug, Clone)]
pub(crate) struct RuleEngineHandle {
    tx: mpsc::UnboundedSender<RuleEvent>,
}

impl RuleEngineHandle {
    pub(crate) fn offer(&self, event: RuleEvent) {
        if self.tx.send(event).is_err() {
            warn!("rule engine stopped; log entry not evaluated");
        }
    }
}

/// Evaluates rules and performs their actions.
#[derive(Clone)]
pub struct RuleEngine {
    tasks: Arc<dyn TaskStore>,
    notifier: Arc<dyn NotificationSender>,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine").finish_non_exhaustive()
    }
}

impl RuleEngine {
    /// Creates a rule engine over the given collaborators.
    #[must_use]
    pub fn new(tasks: Arc<dyn TaskStore>, notifier: Arc<dyn NotificationSender>) -> Self {
        Self { tasks, notifier }
    }

    /// Builds the scope rule conditions are evaluated against: the execution
    /// context with the entry available under `log`.
    #[must_use]
    pub fn scope(entry: &ExecutionLogEntry, context: &JsonValue) -> JsonValue {
        let mut scope = match context {
            JsonValue::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("context".to_string(), other.clone());
                map
            }
        };
        scope.insert(
            "log".to_string(),
            json!({
                "seq": entry.seq,
                "level": entry.level,
                "message": entry.message,
                "node_id": entry.node_id,
                "data": entry.data,
            }),
        );
        JsonValue::Object(scope)
    }

    /// Returns the first enabled rule, in priority order, whose condition
    /// holds for `scope`.
    ///
    /// Disabled rules are never evaluated. A condition that fails to
    /// evaluate counts as not matching.
    #[must_use]
    pub fn select<'a>(rules: &'a [Rule], scope: &JsonValue) -> Option<&'a Rule> {
        let mut candidates: Vec<&Rule> = rules.iter().filter(|rule| rule.enabled).collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        candidates
            .into_iter()
            .find(|rule| match rule.condition.evaluate(scope) {
                Ok(matched) => matched,
                Err(error) => {
                    warn!(rule = %rule.name, %error, "rule condition failed to evaluate");
                    false
                }
            })
    }

    /// Evaluates the rules of `definition` against an entry and performs the
    /// action of the rule that fires.
    pub async fn evaluate(
        &self,
        execution_id: ExecutionId,
        definition: &WorkflowDefinition,
        entry: &ExecutionLogEntry,
        context: &JsonValue,
    ) -> Option<RuleOutcome> {
        let scope = Self::scope(entry, context);
        let rule = Self::select(&definition.rules, &scope)?;
        info!(
            %execution_id,
            rule = %rule.name,
            kind = ?rule.kind(),
            seq = entry.seq,
            "rule fired"
        );
        self.apply(execution_id, definition, rule, entry, &scope).await
    }

    async fn apply(
        &self,
        execution_id: ExecutionId,
        definition: &WorkflowDefinition,
        rule: &Rule,
        entry: &ExecutionLogEntry,
        scope: &JsonValue,
    ) -> Option<RuleOutcome> {
        let failed = |reason: String| {
            Some(RuleOutcome::ActionFailed {
                rule: rule.name.clone(),
                reason,
            })
        };

        match &rule.action {
            RuleAction::Automation {
                title,
                assignee,
                priority,
            } => {
                let task = NewTask {
                    title: template::render_text(title, scope),
                    assignee: assignee.clone(),
                    priority: *priority,
                    execution_id: Some(execution_id),
                };
                match self.tasks.create(task).await {
                    Ok(task_id) => {
                        debug!(%execution_id, %task_id, "automation rule created task");
                        None
                    }
                    Err(error) => failed(error.to_string()),
                }
            }
            RuleAction::Validation(ValidationOutcome::Fail { reason }) => {
                Some(RuleOutcome::Reject {
                    rule: rule.name.clone(),
                    reason: template::render_text(reason, scope),
                })
            }
            RuleAction::Validation(ValidationOutcome::Warn { message }) => Some(RuleOutcome::Warn {
                rule: rule.name.clone(),
                message: template::render_text(message, scope),
            }),
            RuleAction::Notification {
                notification_type,
                recipients,
                template: payload,
            } => {
                let payload = template::render(payload, scope);
                match self
                    .notifier
                    .send(notification_type, recipients, payload)
                    .await
                {
                    Ok(()) => None,
                    Err(error) => failed(error.to_string()),
                }
            }
            RuleAction::Escalation {
                task,
                priority,
                reassign_to,
            } => {
                let task_id = task.clone().or_else(|| {
                    entry
                        .node_id
                        .as_ref()
                        .and_then(|node_id| definition.node(node_id))
                        .and_then(|node| node.task_ref().cloned())
                });
                let Some(task_id) = task_id else {
                    return failed("no task to escalate".to_string());
                };
                let escalation = Escalation {
                    priority: *priority,
                    reassign_to: reassign_to.clone(),
                };
                match self.tasks.escalate(&task_id, escalation).await {
                    Ok(()) => None,
                    Err(error) => failed(error.to_string()),
                }
            }
        }
    }

    /// Starts the rule engine task. Must be called within a tokio runtime.
    pub(crate) fn spawn(self) -> RuleEngineHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<RuleEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let outcome = self
                    .evaluate(
                        event.execution_id,
                        &event.definition,
                        &event.entry,
                        &event.context,
                    )
                    .await;
                if let Some(outcome) = outcome {
                    // The instance may already be terminal.
                    let _ = event.reply.send(InstanceMessage::Rule(outcome));
                }
            }
            debug!("rule engine stopped");
        });
        RuleEngineHandle { tx }
    }
}
