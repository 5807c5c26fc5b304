//! Trigger manager.
//!
//! Holds the registry of triggers and runs one background loop per enabled
//! schedule, event or condition trigger. Loops start executions through an
//! [`ExecutionLauncher`]. A trigger whose evaluation or launch fails
//! `max_consecutive_failures` times in a row is disabled.
//!
//! The registry is the only state shared between loops and callers and is
//! guarded by a single lock that is never held across an await.

use crate::config::SchedulerConfig;
use crate::error::{TriggerError, TriggerEvaluationError};
use crate::event::{EventBus, InMemoryEventBus};
use crate::launcher::ExecutionLauncher;
use crate::predicate::{ConditionPredicate, StatePredicate};
use crate::schedule::Schedule;
use chrono::{DateTime, Utc};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use taskflow_core::{ExecutionId, TriggerId, WorkflowId};
use taskflow_workflow::definition::WorkflowDefinition;
use taskflow_workflow::execution::ExecutionOrigin;
use taskflow_workflow::services::{Clock, SystemClock};
use taskflow_workflow::trigger::{Trigger, TriggerConfig, TriggerKind};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// A registered trigger and its runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    /// The trigger as registered.
    pub trigger: Trigger,
    /// The workflow it starts.
    pub workflow_id: WorkflowId,
    /// Evaluation or launch failures since the last success.
    pub consecutive_failures: u32,
    /// The most recent failure.
    pub last_error: Option<String>,
    /// When the trigger last started an execution.
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Next scheduled fire time, for schedule triggers.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Executions started by this trigger.
    pub fire_count: u64,
}

impl TriggerRecord {
    fn new(workflow_id: WorkflowId, trigger: Trigger) -> Self {
        Self {
            trigger,
            workflow_id,
            consecutive_failures: 0,
            last_error: None,
            last_fired_at: None,
            next_fire_at: None,
            fire_count: 0,
        }
    }

    /// Returns the trigger id.
    #[must_use]
    pub fn id(&self) -> TriggerId {
        self.trigger.id
    }

    /// Returns whether the trigger may fire.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.trigger.enabled
    }
}

/// Result of syncing a workflow's triggers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileResult {
    /// Number of triggers added.
    pub added: u32,
    /// Number of triggers updated.
    pub updated: u32,
    /// Number of triggers deleted.
    pub deleted: u32,
}

impl ReconcileResult {
    /// Returns whether any changes were made.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.added > 0 || self.updated > 0 || self.deleted > 0
    }
}

struct Registration {
    record: TriggerRecord,
    task: Option<JoinHandle<()>>,
}

impl Registration {
    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

type Registry = Arc<Mutex<HashMap<TriggerId, Registration>>>;

fn lock(registry: &Registry) -> std::sync::MutexGuard<'_, HashMap<TriggerId, Registration>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registers triggers and fires them.
///
/// Must be used within a tokio runtime. Dropping the manager stops every
/// trigger loop.
pub struct TriggerManager {
    launcher: Arc<dyn ExecutionLauncher>,
    events: Arc<dyn EventBus>,
    predicates: Arc<dyn ConditionPredicate>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    registry: Registry,
}

impl std::fmt::Debug for TriggerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerManager")
            .field("config", &self.config)
            .field("triggers", &lock(&self.registry).len())
            .finish_non_exhaustive()
    }
}

impl TriggerManager {
    /// Creates a manager with an in-memory event bus, an empty
    /// [`StatePredicate`] and the system clock.
    #[must_use]
    pub fn new(launcher: Arc<dyn ExecutionLauncher>, config: SchedulerConfig) -> Self {
        Self {
            launcher,
            events: Arc::new(InMemoryEventBus::new()),
            predicates: Arc::new(StatePredicate::default()),
            clock: Arc::new(SystemClock),
            config,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sets the event bus event triggers subscribe to.
    #[must_use]
    pub fn with_event_bus(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Sets the evaluator for condition trigger predicates.
    #[must_use]
    pub fn with_predicates(mut self, predicates: Arc<dyn ConditionPredicate>) -> Self {
        self.predicates = predicates;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers a trigger for a workflow and starts its loop if enabled.
    ///
    /// # Errors
    ///
    /// Fails when the id is taken or the configuration is invalid.
    #[instrument(skip(self, trigger), fields(trigger_id = %trigger.id, kind = ?trigger.kind()))]
    pub fn register(
        &self,
        workflow_id: WorkflowId,
        trigger: Trigger,
    ) -> Result<TriggerId, Report<TriggerError>> {
        self.check(&trigger)?;
        let id = trigger.id;

        let mut registry = lock(&self.registry);
        if registry.contains_key(&id) {
            return Err(TriggerError::AlreadyExists { id })?;
        }
        let mut registration = Registration {
            record: TriggerRecord::new(workflow_id, trigger),
            task: None,
        };
        self.start(&mut registration);
        registry.insert(id, registration);
        info!(%workflow_id, "trigger registered");
        Ok(id)
    }

    /// Replaces a trigger's configuration and restarts its loop. Failure
    /// counters are reset.
    ///
    /// # Errors
    ///
    /// Fails when the trigger is unknown or the configuration is invalid.
    pub fn update(&self, trigger: Trigger) -> Result<(), Report<TriggerError>> {
        self.check(&trigger)?;
        let id = trigger.id;

        let mut registry = lock(&self.registry);
        let registration = registry
            .get_mut(&id)
            .ok_or(TriggerError::NotFound { id })?;
        registration.stop();
        registration.record = TriggerRecord::new(registration.record.workflow_id, trigger);
        self.start(registration);
        info!(trigger_id = %id, "trigger updated");
        Ok(())
    }

    /// Removes a trigger and stops its loop.
    ///
    /// # Errors
    ///
    /// Fails when the trigger is unknown.
    pub fn delete(&self, id: TriggerId) -> Result<(), Report<TriggerError>> {
        let mut registration = lock(&self.registry)
            .remove(&id)
            .ok_or(TriggerError::NotFound { id })?;
        registration.stop();
        info!(trigger_id = %id, "trigger deleted");
        Ok(())
    }

    /// Returns a trigger's record.
    ///
    /// # Errors
    ///
    /// Fails when the trigger is unknown.
    pub fn get(&self, id: TriggerId) -> Result<TriggerRecord, Report<TriggerError>> {
        let record = lock(&self.registry)
            .get(&id)
            .map(|registration| registration.record.clone())
            .ok_or(TriggerError::NotFound { id })?;
        Ok(record)
    }

    /// Lists the triggers of a workflow, oldest first.
    #[must_use]
    pub fn list_for_workflow(&self, workflow_id: WorkflowId) -> Vec<TriggerRecord> {
        let mut records: Vec<TriggerRecord> = lock(&self.registry)
            .values()
            .filter(|registration| registration.record.workflow_id == workflow_id)
            .map(|registration| registration.record.clone())
            .collect();
        records.sort_by_key(|record| (record.trigger.created_at, record.id()));
        records
    }

    /// Enables or disables a trigger. Enabling resets its failure counter.
    ///
    /// # Errors
    ///
    /// Fails when the trigger is unknown.
    pub fn set_enabled(&self, id: TriggerId, enabled: bool) -> Result<(), Report<TriggerError>> {
        let mut registry = lock(&self.registry);
        let registration = registry
            .get_mut(&id)
            .ok_or(TriggerError::NotFound { id })?;
        registration.stop();
        if enabled {
            registration.record.trigger.enable();
            registration.record.consecutive_failures = 0;
            registration.record.last_error = None;
            self.start(registration);
        } else {
            registration.record.trigger.disable();
            registration.record.next_fire_at = None;
        }
        info!(trigger_id = %id, enabled, "trigger toggled");
        Ok(())
    }

    /// Fires a trigger now, regardless of its kind.
    ///
    /// # Errors
    ///
    /// Fails when the trigger is unknown or disabled, or when the execution
    /// could not be launched.
    #[instrument(skip(self, context))]
    pub async fn fire_manual(
        &self,
        id: TriggerId,
        context: JsonValue,
    ) -> Result<ExecutionId, Report<TriggerError>> {
        let record = self.get(id)?;
        if !record.is_enabled() {
            return Err(TriggerError::Disabled { id })?;
        }
        let execution_id = fire(
            &self.registry,
            self.launcher.as_ref(),
            self.clock.as_ref(),
            id,
            record.workflow_id,
            context,
        )
        .await
        .map_err(|reason| TriggerError::LaunchFailed { id, reason })?;
        Ok(execution_id)
    }

    /// Brings the registry in line with a definition's triggers.
    ///
    /// Only active definitions keep triggers: for any other status every
    /// trigger of the workflow is removed.
    ///
    /// # Errors
    ///
    /// Fails when one of the definition's triggers is invalid. Changes made
    /// before the failure are kept.
    #[instrument(skip(self, definition), fields(workflow_id = %definition.id))]
    pub fn sync_workflow(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<ReconcileResult, Report<TriggerError>> {
        let workflow_id = definition.id;
        let desired: &[Trigger] = if definition.is_triggerable() {
            &definition.triggers
        } else {
            &[]
        };
        let mut result = ReconcileResult::default();

        let wanted: HashSet<TriggerId> = desired.iter().map(|trigger| trigger.id).collect();
        for record in self.list_for_workflow(workflow_id) {
            if !wanted.contains(&record.id()) {
                self.delete(record.id())?;
                result.deleted += 1;
            }
        }

        for trigger in desired {
            let existing = lock(&self.registry)
                .get(&trigger.id)
                .map(|registration| registration.record.trigger.clone());
            match existing {
                None => {
                    self.register(workflow_id, trigger.clone())?;
                    result.added += 1;
                }
                Some(current) if !same_trigger(&current, trigger) => {
                    self.update(trigger.clone())?;
                    result.updated += 1;
                }
                Some(_) => {}
            }
        }

        info!(
            added = result.added,
            updated = result.updated,
            deleted = result.deleted,
            "triggers synced"
        );
        Ok(result)
    }

    /// Stops every trigger loop. Registrations are kept.
    pub fn shutdown(&self) {
        for registration in lock(&self.registry).values_mut() {
            registration.stop();
        }
        debug!("trigger loops stopped");
    }

    fn check(&self, trigger: &Trigger) -> Result<(), TriggerError> {
        let id = trigger.id;
        let invalid = |reason: String| TriggerError::InvalidConfig { id, reason };
        match &trigger.config {
            TriggerConfig::Manual => Ok(()),
            TriggerConfig::Schedule { recurrence } => Schedule::new(*recurrence)
                .map(|_| ())
                .map_err(|error| invalid(error.to_string())),
            TriggerConfig::Event { event } if event.trim().is_empty() => {
                Err(invalid("empty event name".to_string()))
            }
            TriggerConfig::Event { .. } => Ok(()),
            TriggerConfig::Condition {
                predicate,
                interval_secs,
            } => {
                if *interval_secs == Some(0) {
                    return Err(invalid("poll interval must be positive".to_string()));
                }
                self.predicates.check(predicate).map_err(invalid)
            }
        }
    }

    /// Spawns the loop of an enabled, non-manual trigger.
    fn start(&self, registration: &mut Registration) {
        let record = &mut registration.record;
        if !record.is_enabled() || record.trigger.kind() == TriggerKind::Manual {
            return;
        }

        let runner = TriggerLoop {
            id: record.id(),
            workflow_id: record.workflow_id,
            launcher: Arc::clone(&self.launcher),
            clock: Arc::clone(&self.clock),
            registry: Arc::clone(&self.registry),
            max_failures: self.config.max_consecutive_failures.max(1),
        };

        let task = match &record.trigger.config {
            TriggerConfig::Manual => return,
            TriggerConfig::Schedule { recurrence } => {
                let Ok(schedule) = Schedule::new(*recurrence) else {
                    return;
                };
                record.next_fire_at = schedule.next_after(self.clock.now()).ok();
                tokio::spawn(runner.run_schedule(schedule))
            }
            TriggerConfig::Event { event } => {
                // Subscribe now so events published right after
                // registration are not missed.
                let events = self.events.subscribe(event);
                tokio::spawn(runner.run_event(events))
            }
            TriggerConfig::Condition {
                predicate,
                interval_secs,
            } => {
                let interval = interval_secs
                    .map_or_else(|| self.config.default_poll_interval(), Duration::from_secs);
                tokio::spawn(runner.run_condition(
                    Arc::clone(&self.predicates),
                    predicate.clone(),
                    interval,
                ))
            }
        };
        registration.task = Some(task);
    }
}

impl Drop for TriggerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Triggers are compared by what they do, not by their timestamps.
fn same_trigger(a: &Trigger, b: &Trigger) -> bool {
    a.config == b.config && a.enabled == b.enabled
}

/// Starts an execution for a trigger and records the outcome.
async fn fire(
    registry: &Registry,
    launcher: &dyn ExecutionLauncher,
    clock: &dyn Clock,
    id: TriggerId,
    workflow_id: WorkflowId,
    context: JsonValue,
) -> Result<ExecutionId, String> {
    let origin = ExecutionOrigin::Trigger { trigger_id: id };
    let result = launcher.launch(workflow_id, context, origin).await;
    if let Ok(execution_id) = &result {
        if let Some(registration) = lock(registry).get_mut(&id) {
            let record = &mut registration.record;
            record.consecutive_failures = 0;
            record.last_error = None;
            record.last_fired_at = Some(clock.now());
            record.fire_count += 1;
        }
        info!(trigger_id = %id, %workflow_id, %execution_id, "trigger fired");
    }
    result
}

/// Wraps an event payload into an execution context.
fn event_context(event: &str, payload: JsonValue) -> JsonValue {
    match payload {
        JsonValue::Object(mut fields) => {
            fields
                .entry("event".to_string())
                .or_insert_with(|| json!(event));
            JsonValue::Object(fields)
        }
        JsonValue::Null => json!({ "event": event }),
        other => json!({ "event": event, "payload": other }),
    }
}

/// The background loop of one trigger.
struct TriggerLoop {
    id: TriggerId,
    workflow_id: WorkflowId,
    launcher: Arc<dyn ExecutionLauncher>,
    clock: Arc<dyn Clock>,
    registry: Registry,
    max_failures: u32,
}

enum Verdict {
    Continue,
    Stop,
}

impl TriggerLoop {
    async fn fire(&self, context: JsonValue) -> Verdict {
        match fire(
            &self.registry,
            self.launcher.as_ref(),
            self.clock.as_ref(),
            self.id,
            self.workflow_id,
            context,
        )
        .await
        {
            Ok(_) => Verdict::Continue,
            Err(reason) => self.failed(reason),
        }
    }

    /// Clears the failure streak after a successful evaluation.
    fn succeeded(&self) {
        if let Some(registration) = lock(&self.registry).get_mut(&self.id) {
            registration.record.consecutive_failures = 0;
            registration.record.last_error = None;
        }
    }

    /// Counts a failure and disables the trigger once the limit is reached.
    fn failed(&self, reason: String) -> Verdict {
        let error = TriggerEvaluationError {
            trigger_id: self.id,
            reason,
        };
        warn!(%error, "trigger evaluation failed");

        let mut registry = lock(&self.registry);
        let Some(registration) = registry.get_mut(&self.id) else {
            return Verdict::Stop;
        };
        let record = &mut registration.record;
        record.consecutive_failures += 1;
        record.last_error = Some(error.reason);
        if record.consecutive_failures < self.max_failures {
            return Verdict::Continue;
        }

        record.trigger.disable();
        record.next_fire_at = None;
        // The loop is exiting on its own; nothing to abort.
        registration.task = None;
        error!(
            trigger_id = %self.id,
            failures = record.consecutive_failures,
            "trigger disabled after repeated failures"
        );
        Verdict::Stop
    }

    fn set_next_fire(&self, at: Option<DateTime<Utc>>) -> bool {
        match lock(&self.registry).get_mut(&self.id) {
            Some(registration) => {
                registration.record.next_fire_at = at;
                true
            }
            None => false,
        }
    }

    async fn run_schedule(self, schedule: Schedule) {
        let mut last_slot: Option<DateTime<Utc>> = None;
        loop {
            let now = self.clock.now();
            // A clock that wakes early must not hand out the slot just fired.
            let after = last_slot.map_or(now, |slot| slot.max(now));
            let next = match schedule.next_after(after) {
                Ok(next) => next,
                Err(error) => {
                    self.failed(error.to_string());
                    break;
                }
            };
            if !self.set_next_fire(Some(next)) {
                break;
            }
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(trigger_id = %self.id, %next, "schedule trigger sleeping");
            self.clock.sleep(delay).await;
            last_slot = Some(next);

            let context = json!({ "scheduled_for": next });
            if let Verdict::Stop = self.fire(context).await {
                break;
            }
        }
    }

    async fn run_event(self, mut events: broadcast::Receiver<JsonValue>) {
        loop {
            match events.recv().await {
                Ok(payload) => {
                    let event = self.event_name();
                    if let Verdict::Stop = self.fire(event_context(&event, payload)).await {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(trigger_id = %self.id, skipped, "event trigger lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn event_name(&self) -> String {
        lock(&self.registry)
            .get(&self.id)
            .and_then(|registration| match &registration.record.trigger.config {
                TriggerConfig::Event { event } => Some(event.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Polls the predicate and fires when it turns from false to true.
    async fn run_condition(
        self,
        predicates: Arc<dyn ConditionPredicate>,
        predicate: String,
        interval: Duration,
    ) {
        let mut was_true = false;
        loop {
            let evaluated = predicates.evaluate(&predicate).await;
            if evaluated.is_ok() {
                self.succeeded();
            }
            match evaluated {
                Ok(true) if !was_true => {
                    was_true = true;
                    let context = json!({ "predicate": predicate });
                    if let Verdict::Stop = self.fire(context).await {
                        break;
                    }
                }
                Ok(holds) => was_true = holds,
                Err(reason) => {
                    if let Verdict::Stop = self.failed(reason) {
                        break;
                    }
                }
            }
            self.clock.sleep(interval).await;
        }
    }
}
