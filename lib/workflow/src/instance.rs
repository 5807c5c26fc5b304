//! Execution instance actor.
//!
//! Each execution is owned by one actor task. Task completions, timer
//! firings, child results, rule outcomes and control requests all arrive as
//! [`InstanceMessage`]s and are processed strictly in arrival order. One
//! message is one transition: the actor runs its step worklist to a
//! suspension point before looking at the next message, so a cancel never
//! interrupts a transition in progress.
//!
//! Every completed node occurrence appends exactly one log entry.

use crate::definition::WorkflowDefinition;
use crate::edge::{Edge, EdgeKind};
use crate::engine::EngineInner;
use crate::error::ExecutionFailure;
use crate::execution::{
    ExecutionLog, ExecutionOrigin, ExecutionSnapshot, ExecutionStatus, LogLevel, Occurrence,
};
use crate::frontier::{Frontier, JoinOutcome, Suspension};
use crate::graph::WorkflowGraph;
use crate::node::{DecisionBranch, Node, NodeConfig};
use crate::rule_engine::{RuleEvent, RuleOutcome};
use crate::services::TaskOutcome;
use crate::template;
use chrono::{DateTime, Utc};
use serde_json::{Value as JsonValue, json};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use taskflow_core::{EdgeId, ExecutionId, NodeId, TaskId, WorkflowId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// A message delivered to an instance actor.
#[derive(Debug)]
pub(crate) enum InstanceMessage {
    /// The external task system reported a completion.
    TaskCompleted { task_id: TaskId, outcome: TaskOutcome },
    /// A wait node's timer fired.
    TimerFired(Occurrence),
    /// A task's retry backoff elapsed.
    RetryTask(Occurrence),
    /// A child execution reached a terminal status.
    ChildFinished {
        occurrence: Occurrence,
        snapshot: Arc<ExecutionSnapshot>,
    },
    /// A rule fired for one of this instance's log entries.
    Rule(RuleOutcome),
    Pause,
    Resume,
    Cancel,
    /// The maximum duration elapsed.
    Timeout,
}

/// The parent side of a subprocess execution.
#[derive(Debug)]
pub(crate) struct Parent {
    pub tx: mpsc::UnboundedSender<InstanceMessage>,
    pub occurrence: Occurrence,
}

/// Everything needed to start an instance.
pub(crate) struct Launch {
    pub id: ExecutionId,
    pub definition: Arc<WorkflowDefinition>,
    pub context: JsonValue,
    pub origin: ExecutionOrigin,
    pub depth: u32,
    pub parent: Option<Parent>,
}

#[derive(Debug)]
enum Step {
    Arrive {
        edge: EdgeId,
        target: NodeId,
        live: bool,
    },
    Activate(NodeId),
    Complete {
        occurrence: Occurrence,
        route: Route,
    },
    Skip(NodeId),
}

#[derive(Debug)]
enum Route {
    /// Every outgoing edge, conditions ignored.
    Unconditional,
    /// Every outgoing edge whose condition holds.
    All,
    /// Only the chosen decision branch.
    Chosen(EdgeId),
}

type Transition = Result<(), ExecutionFailure>;

pub(crate) struct Instance {
    id: ExecutionId,
    definition: Arc<WorkflowDefinition>,
    graph: WorkflowGraph,
    origin: ExecutionOrigin,
    depth: u32,
    status: ExecutionStatus,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    frontier: Frontier,
    /// Cycles that have had at least one node activated.
    entered_cycles: HashSet<usize>,
    context: JsonValue,
    log: ExecutionLog,
    failure: Option<ExecutionFailure>,
    steps: VecDeque<Step>,
    held: VecDeque<InstanceMessage>,
    rules_enabled: bool,
    engine: Arc<EngineInner>,
    tx: mpsc::UnboundedSender<InstanceMessage>,
    snapshots: watch::Sender<Arc<ExecutionSnapshot>>,
    parent: Option<Parent>,
}

/// Normalizes an initial context into an object.
pub(crate) fn initial_context(context: JsonValue) -> JsonValue {
    match context {
        JsonValue::Object(_) => context,
        JsonValue::Null => JsonValue::Object(serde_json::Map::new()),
        other => json!({ "input": other }),
    }
}

/// Builds the snapshot of an instance that has not processed anything yet.
pub(crate) fn initial_snapshot(
    launch: &Launch,
    started_at: DateTime<Utc>,
) -> ExecutionSnapshot {
    ExecutionSnapshot {
        id: launch.id,
        flow_id: launch.definition.id,
        flow_version: launch.definition.version,
        origin: launch.origin.clone(),
        status: ExecutionStatus::Running,
        started_at,
        ended_at: None,
        active: Vec::new(),
        context: launch.context.clone(),
        progress: 0,
        log: ExecutionLog::new(),
        failure: None,
    }
}

impl Instance {
    pub(crate) fn new(
        launch: Launch,
        started_at: DateTime<Utc>,
        engine: Arc<EngineInner>,
        tx: mpsc::UnboundedSender<InstanceMessage>,
        snapshots: watch::Sender<Arc<ExecutionSnapshot>>,
    ) -> Self {
        let graph = WorkflowGraph::from_definition(&launch.definition);
        let rules_enabled = launch.definition.rules.iter().any(|rule| rule.enabled);
        Self {
            id: launch.id,
            definition: launch.definition,
            graph,
            origin: launch.origin,
            depth: launch.depth,
            status: ExecutionStatus::Running,
            started_at,
            ended_at: None,
            frontier: Frontier::new(),
            entered_cycles: HashSet::new(),
            context: launch.context,
            log: ExecutionLog::new(),
            failure: None,
            steps: VecDeque::new(),
            held: VecDeque::new(),
            rules_enabled,
            engine,
            tx,
            snapshots,
            parent: launch.parent,
        }
    }

    fn flow_id(&self) -> WorkflowId {
        self.definition.id
    }

    /// Runs the actor until the instance reaches a terminal status.
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<InstanceMessage>) {
        info!(
            execution_id = %self.id,
            flow_id = %self.flow_id(),
            version = self.definition.version,
            depth = self.depth,
            "execution started"
        );

        self.begin().await;
        self.publish();

        while !self.status.is_terminal() {
            let held = if self.status == ExecutionStatus::Running {
                self.held.pop_front()
            } else {
                None
            };
            let message = match held {
                Some(message) => message,
                None => match rx.recv().await {
                    Some(message) => message,
                    None => break,
                },
            };
            self.handle(message).await;
            self.publish();
        }

        self.shutdown();
    }

    async fn begin(&mut self) {
        let max_duration = self
            .definition
            .settings
            .max_duration()
            .or_else(|| self.engine.config.default_max_duration());
        if let Some(max_duration) = max_duration {
            self.schedule(max_duration, InstanceMessage::Timeout);
        }

        let result = match self.graph.start() {
            Some(start) => {
                self.steps.push_back(Step::Activate(start.id.clone()));
                self.drain().await
            }
            None => Err(ExecutionFailure::Collaborator {
                node_id: None,
                reason: "definition has no start node".to_string(),
            }),
        };
        self.conclude(result);
    }

    async fn handle(&mut self, message: InstanceMessage) {
        let result = match message {
            InstanceMessage::Cancel => {
                self.cancel();
                return;
            }
            InstanceMessage::Timeout => Err(ExecutionFailure::Timeout {
                max_duration_ms: self.max_duration_ms(),
            }),
            InstanceMessage::Pause => {
                if self.status == ExecutionStatus::Running {
                    self.status = ExecutionStatus::Paused;
                    self.append(LogLevel::Info, "Execution paused", None, None);
                    info!(execution_id = %self.id, "execution paused");
                }
                return;
            }
            InstanceMessage::Resume => {
                if self.status == ExecutionStatus::Paused {
                    self.status = ExecutionStatus::Running;
                    self.append(LogLevel::Info, "Execution resumed", None, None);
                    info!(execution_id = %self.id, held = self.held.len(), "execution resumed");
                }
                return;
            }
            other if self.status == ExecutionStatus::Paused => {
                self.held.push_back(other);
                return;
            }
            InstanceMessage::TaskCompleted { task_id, outcome } => {
                self.on_task_completed(&task_id, outcome)
            }
            InstanceMessage::TimerFired(occurrence) => self.on_timer(occurrence),
            InstanceMessage::RetryTask(occurrence) => self.on_retry(occurrence).await,
            InstanceMessage::ChildFinished {
                occurrence,
                snapshot,
            } => self.on_child_finished(occurrence, &snapshot),
            InstanceMessage::Rule(outcome) => self.on_rule(outcome),
        };

        let result = match result {
            Ok(()) => self.drain().await,
            Err(failure) => Err(failure),
        };
        self.conclude(result);
    }

    fn conclude(&mut self, result: Transition) {
        match result {
            Err(failure) => self.fail(failure),
            Ok(()) => self.settle(),
        }
    }

    /// Completes or fails the instance once nothing is left to run.
    fn settle(&mut self) {
        if self.status != ExecutionStatus::Running || !self.frontier.is_idle() {
            return;
        }
        let pending = self.frontier.pending_joins();
        if pending.is_empty() {
            self.finish(ExecutionStatus::Completed);
        } else {
            self.fail(ExecutionFailure::JoinNeverSatisfied { nodes: pending });
        }
    }

    async fn drain(&mut self) -> Transition {
        let limit = self.engine.config.max_steps_per_transition;
        let mut processed = 0usize;

        while let Some(step) = self.steps.pop_front() {
            processed += 1;
            if processed > limit {
                self.steps.clear();
                return Err(ExecutionFailure::StepLimitExceeded { limit });
            }

            let result = match step {
                Step::Arrive { edge, target, live } => {
                    self.arrive(edge, target, live);
                    Ok(())
                }
                Step::Activate(node_id) => self.activate(node_id).await,
                Step::Complete { occurrence, route } => self.complete(occurrence, &route),
                Step::Skip(node_id) => {
                    self.skip(&node_id);
                    Ok(())
                }
            };
            if let Err(failure) = result {
                self.steps.clear();
                return Err(failure);
            }
        }
        Ok(())
    }

    fn arrive(&mut self, edge: EdgeId, target: NodeId, live: bool) {
        if self.graph.is_back_edge(&edge) {
            if live {
                // A new iteration starts; joins inside the loop begin empty.
                if let Some(cycle) = self.graph.cycle_of(&target) {
                    let graph = &self.graph;
                    self.frontier
                        .reset_joins(|node_id| graph.cycle_of(node_id) == Some(cycle));
                }
                self.steps.push_back(Step::Activate(target));
            }
            return;
        }

        let inputs: Vec<&EdgeId> = self
            .graph
            .join_inputs(&target)
            .into_iter()
            .map(|input| &input.id)
            .collect();
        match self.frontier.arrive(&target, &edge, live, &inputs) {
            JoinOutcome::Waiting => {
                debug!(execution_id = %self.id, node_id = %target, %edge, "join waiting");
            }
            JoinOutcome::Ready { live: true } => self.steps.push_back(Step::Activate(target)),
            JoinOutcome::Ready { live: false } => self.steps.push_back(Step::Skip(target)),
        }
    }

    async fn activate(&mut self, node_id: NodeId) -> Transition {
        let node = self
            .graph
            .node(&node_id)
            .cloned()
            .ok_or_else(|| ExecutionFailure::Collaborator {
                node_id: Some(node_id.clone()),
                reason: "node missing from graph".to_string(),
            })?;
        let occurrence = self.frontier.next_occurrence(&node_id);
        if let Some(cycle) = self.graph.cycle_of(&node_id) {
            self.entered_cycles.insert(cycle);
        }
        debug!(execution_id = %self.id, %occurrence, kind = %node.kind(), "activating node");

        match &node.config {
            NodeConfig::Start => {
                self.append(LogLevel::Info, "Workflow started", Some(node_id), None);
                self.steps.push_back(Step::Complete {
                    occurrence,
                    route: Route::Unconditional,
                });
            }
            NodeConfig::Task { task, .. } => {
                self.frontier.suspend(
                    occurrence.clone(),
                    Suspension::Task {
                        task_id: task.clone(),
                        attempt: 1,
                    },
                );
                self.activate_task(&node_id, task).await?;
                info!(execution_id = %self.id, %occurrence, task_id = %task, "waiting on task");
            }
            NodeConfig::Decision { branches } => {
                let edge = self.decide(&node_id, branches)?;
                self.append(
                    LogLevel::Info,
                    format!("Decision '{}' took edge {edge}", node.name),
                    Some(node_id),
                    Some(json!({ "edge": edge, "visit": occurrence.visit })),
                );
                self.steps.push_back(Step::Complete {
                    occurrence,
                    route: Route::Chosen(edge),
                });
            }
            NodeConfig::Wait { duration_ms } => {
                self.frontier
                    .suspend(occurrence.clone(), Suspension::Timer);
                self.schedule(
                    Duration::from_millis(*duration_ms),
                    InstanceMessage::TimerFired(occurrence),
                );
            }
            NodeConfig::Notification {
                notification_type,
                recipients,
                template: payload,
            } => {
                let payload = template::render(payload, &self.context);
                self.send_notification(notification_type.clone(), recipients.clone(), payload);
                self.append(
                    LogLevel::Info,
                    format!("Notification '{}' sent", node.name),
                    Some(node_id),
                    Some(json!({ "type": notification_type, "recipients": recipients })),
                );
                self.steps.push_back(Step::Complete {
                    occurrence,
                    route: Route::All,
                });
            }
            NodeConfig::Subprocess { workflow, .. } => {
                self.start_child(&node_id, occurrence, *workflow).await?;
            }
            NodeConfig::End => {
                self.append(
                    LogLevel::Success,
                    format!("Reached end '{}'", node.name),
                    Some(node_id),
                    None,
                );
                self.steps.push_back(Step::Complete {
                    occurrence,
                    route: Route::All,
                });
            }
        }
        Ok(())
    }

    async fn activate_task(&self, node_id: &NodeId, task_id: &TaskId) -> Transition {
        self.engine
            .tasks
            .activate(task_id, self.id)
            .await
            .map_err(|error| ExecutionFailure::Collaborator {
                node_id: Some(node_id.clone()),
                reason: error.to_string(),
            })
    }

    /// Picks the first branch whose condition holds, in declaration order.
    fn decide(&self, node_id: &NodeId, branches: &[DecisionBranch]) -> Result<EdgeId, ExecutionFailure> {
        let candidates: Vec<DecisionBranch> = if branches.is_empty() {
            self.graph
                .outgoing(node_id)
                .into_iter()
                .map(|edge| DecisionBranch {
                    condition: edge.condition.clone(),
                    edge: edge.id.clone(),
                })
                .collect()
        } else {
            branches.to_vec()
        };

        for branch in candidates {
            let Some(condition) = &branch.condition else {
                return Ok(branch.edge);
            };
            let matched = condition.evaluate(&self.context).map_err(|error| {
                ExecutionFailure::InvalidCondition {
                    node_id: node_id.clone(),
                    condition: condition.to_string(),
                    reason: error.to_string(),
                }
            })?;
            if matched {
                return Ok(branch.edge);
            }
        }

        Err(ExecutionFailure::UnmatchedDecision {
            node_id: node_id.clone(),
        })
    }

    fn complete(&mut self, occurrence: Occurrence, route: &Route) -> Transition {
        self.frontier.complete(&occurrence);
        let node_id = occurrence.node_id;

        let mut arrivals = Vec::new();
        for edge in self.graph.outgoing(&node_id) {
            let taken = match route {
                Route::Unconditional => true,
                Route::Chosen(chosen) => &edge.id == chosen,
                Route::All => match (&edge.kind, &edge.condition) {
                    (EdgeKind::Conditional, Some(condition)) => {
                        condition.evaluate(&self.context).map_err(|error| {
                            ExecutionFailure::InvalidCondition {
                                node_id: node_id.clone(),
                                condition: condition.to_string(),
                                reason: error.to_string(),
                            }
                        })?
                    }
                    _ => true,
                },
            };
            if taken || self.propagates_skip(edge) {
                arrivals.push(Step::Arrive {
                    edge: edge.id.clone(),
                    target: edge.target.clone(),
                    live: taken,
                });
            }
        }
        self.steps.extend(arrivals);
        Ok(())
    }

    /// Returns true if a skip token may travel over `edge`.
    ///
    /// Back edges never carry skips. Inside a cycle a skip is scoped to the
    /// current iteration. An edge leaving a cycle that has run may still be
    /// taken on a later iteration, so it carries no skip.
    fn propagates_skip(&self, edge: &Edge) -> bool {
        if self.graph.is_back_edge(&edge.id) {
            return false;
        }
        match self.graph.cycle_of(&edge.source) {
            None => true,
            Some(cycle) => {
                self.graph.cycle_of(&edge.target) == Some(cycle)
                    || !self.entered_cycles.contains(&cycle)
            }
        }
    }

    fn skip(&mut self, node_id: &NodeId) {
        debug!(execution_id = %self.id, %node_id, "skipping node");
        let arrivals: Vec<Step> = self
            .graph
            .outgoing(node_id)
            .into_iter()
            .filter(|edge| self.propagates_skip(edge))
            .map(|edge| Step::Arrive {
                edge: edge.id.clone(),
                target: edge.target.clone(),
                live: false,
            })
            .collect();
        self.steps.extend(arrivals);
    }

    fn on_task_completed(&mut self, task_id: &TaskId, outcome: TaskOutcome) -> Transition {
        let Some((occurrence, attempt)) = self.frontier.waiting_on_task(task_id) else {
            debug!(execution_id = %self.id, %task_id, "completion for a task nobody waits on");
            return Ok(());
        };
        let node = self.node_for(&occurrence)?;

        match outcome {
            TaskOutcome::Success { output } => {
                self.merge_output(&node.id, output);
                self.append(
                    LogLevel::Success,
                    format!("Task '{}' completed", node.name),
                    Some(node.id.clone()),
                    Some(json!({
                        "task_id": task_id,
                        "attempt": attempt,
                        "visit": occurrence.visit,
                    })),
                );
                self.steps.push_back(Step::Complete {
                    occurrence,
                    route: Route::All,
                });
                Ok(())
            }
            TaskOutcome::Failure { reason } => {
                let policy = match &node.config {
                    NodeConfig::Task {
                        retry: Some(policy),
                        ..
                    } => Some(policy.clone()),
                    _ => self.engine.config.default_retry.clone(),
                };
                let max_attempts = policy.as_ref().map_or(1, |policy| policy.max_attempts.max(1));

                let Some(policy) = policy.filter(|_| attempt < max_attempts) else {
                    return Err(ExecutionFailure::TaskFailure {
                        node_id: node.id,
                        task_id: task_id.clone(),
                        attempts: attempt,
                        reason,
                    });
                };

                let backoff = policy.backoff_before(attempt + 1);
                warn!(
                    execution_id = %self.id,
                    %occurrence,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "task failed; retrying"
                );
                self.append(
                    LogLevel::Warning,
                    format!(
                        "Task '{}' failed (attempt {attempt}/{max_attempts}): {reason}; retrying in {}ms",
                        node.name,
                        backoff.as_millis()
                    ),
                    Some(node.id.clone()),
                    Some(json!({ "task_id": task_id, "attempt": attempt })),
                );
                self.frontier.suspend(
                    occurrence.clone(),
                    Suspension::RetryBackoff {
                        task_id: task_id.clone(),
                        attempt,
                    },
                );
                self.schedule(backoff, InstanceMessage::RetryTask(occurrence));
                Ok(())
            }
        }
    }

    async fn on_retry(&mut self, occurrence: Occurrence) -> Transition {
        let Some(Suspension::RetryBackoff { task_id, attempt }) =
            self.frontier.suspension(&occurrence).cloned()
        else {
            return Ok(());
        };
        self.frontier.suspend(
            occurrence.clone(),
            Suspension::Task {
                task_id: task_id.clone(),
                attempt: attempt + 1,
            },
        );
        self.activate_task(&occurrence.node_id, &task_id).await?;
        info!(execution_id = %self.id, %occurrence, attempt = attempt + 1, "task re-activated");
        Ok(())
    }

    fn on_timer(&mut self, occurrence: Occurrence) -> Transition {
        if self.frontier.suspension(&occurrence) != Some(&Suspension::Timer) {
            return Ok(());
        }
        let node = self.node_for(&occurrence)?;
        self.append(
            LogLevel::Info,
            format!("Wait '{}' finished", node.name),
            Some(node.id),
            None,
        );
        self.steps.push_back(Step::Complete {
            occurrence,
            route: Route::All,
        });
        Ok(())
    }

    async fn start_child(
        &mut self,
        node_id: &NodeId,
        occurrence: Occurrence,
        workflow: WorkflowId,
    ) -> Transition {
        let subprocess_failure = |reason: String| ExecutionFailure::SubprocessFailure {
            node_id: node_id.clone(),
            child: None,
            reason,
        };

        let max_depth = self.engine.config.max_subprocess_depth;
        if self.depth >= max_depth {
            return Err(subprocess_failure(format!(
                "maximum subprocess depth of {max_depth} exceeded"
            )));
        }

        let definition = self
            .engine
            .store
            .get(workflow)
            .await
            .map_err(|error| subprocess_failure(error.to_string()))?;
        definition
            .validate()
            .map_err(|report| subprocess_failure(report.to_string()))?;

        let child = self.engine.launch(Launch {
            id: ExecutionId::new(),
            definition: Arc::new(definition),
            context: self.context.clone(),
            origin: ExecutionOrigin::Subprocess {
                parent: self.id,
                node_id: node_id.clone(),
            },
            depth: self.depth + 1,
            parent: Some(Parent {
                tx: self.tx.clone(),
                occurrence: occurrence.clone(),
            }),
        });
        info!(execution_id = %self.id, %occurrence, child = %child, "subprocess started");
        self.frontier
            .suspend(occurrence, Suspension::Subprocess { child });
        Ok(())
    }

    fn on_child_finished(
        &mut self,
        occurrence: Occurrence,
        snapshot: &ExecutionSnapshot,
    ) -> Transition {
        let waiting = matches!(
            self.frontier.suspension(&occurrence),
            Some(Suspension::Subprocess { child }) if *child == snapshot.id
        );
        if !waiting || !snapshot.is_terminal() {
            return Ok(());
        }
        let node = self.node_for(&occurrence)?;
        let continue_on_error = matches!(
            node.config,
            NodeConfig::Subprocess {
                continue_on_error: true,
                ..
            }
        );

        if snapshot.status == ExecutionStatus::Completed {
            self.merge_output(&node.id, snapshot.context.clone());
            self.append(
                LogLevel::Success,
                format!("Subprocess '{}' completed", node.name),
                Some(node.id.clone()),
                Some(json!({ "child": snapshot.id })),
            );
        } else {
            let reason = snapshot.failure.as_ref().map_or_else(
                || format!("child execution {}", snapshot.status),
                ToString::to_string,
            );
            if !continue_on_error {
                return Err(ExecutionFailure::SubprocessFailure {
                    node_id: node.id,
                    child: Some(snapshot.id),
                    reason,
                });
            }
            self.append(
                LogLevel::Warning,
                format!("Subprocess '{}' failed, continuing: {reason}", node.name),
                Some(node.id.clone()),
                Some(json!({ "child": snapshot.id })),
            );
        }

        self.steps.push_back(Step::Complete {
            occurrence,
            route: Route::All,
        });
        Ok(())
    }

    fn on_rule(&mut self, outcome: RuleOutcome) -> Transition {
        match outcome {
            RuleOutcome::Reject { rule, reason } => {
                Err(ExecutionFailure::RuleRejected { rule, reason })
            }
            RuleOutcome::Warn { rule, message } => {
                self.append_unoffered(
                    LogLevel::Warning,
                    format!("Rule '{rule}': {message}"),
                    None,
                    None,
                );
                Ok(())
            }
            RuleOutcome::ActionFailed { rule, reason } => {
                warn!(execution_id = %self.id, %rule, %reason, "rule action failed");
                self.append_unoffered(
                    LogLevel::Warning,
                    format!("Rule '{rule}' action failed: {reason}"),
                    None,
                    None,
                );
                Ok(())
            }
        }
    }

    fn node_for(&self, occurrence: &Occurrence) -> Result<Node, ExecutionFailure> {
        self.graph
            .node(&occurrence.node_id)
            .cloned()
            .ok_or_else(|| ExecutionFailure::Collaborator {
                node_id: Some(occurrence.node_id.clone()),
                reason: "node missing from graph".to_string(),
            })
    }

    /// Merges a node's output into the context. Objects are merged key by
    /// key; any other value is stored under the node id.
    fn merge_output(&mut self, node_id: &NodeId, output: JsonValue) {
        let JsonValue::Object(context) = &mut self.context else {
            return;
        };
        match output {
            JsonValue::Null => {}
            JsonValue::Object(fields) => context.extend(fields),
            other => {
                context.insert(node_id.to_string(), other);
            }
        }
    }

    fn schedule(&self, delay: Duration, message: InstanceMessage) {
        let tx = self.tx.clone();
        let clock = Arc::clone(&self.engine.clock);
        tokio::spawn(async move {
            clock.sleep(delay).await;
            // The instance may have finished in the meantime.
            let _ = tx.send(message);
        });
    }

    fn send_notification(&self, kind: String, recipients: Vec<String>, payload: JsonValue) {
        let notifier = Arc::clone(&self.engine.notifier);
        let execution_id = self.id;
        tokio::spawn(async move {
            if let Err(error) = notifier.send(&kind, &recipients, payload).await {
                warn!(%execution_id, %kind, %error, "notification delivery failed");
            }
        });
    }

    fn max_duration_ms(&self) -> u64 {
        self.definition
            .settings
            .max_duration()
            .or_else(|| self.engine.config.default_max_duration())
            .map_or(0, |duration| {
                u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
            })
    }

    fn append(
        &mut self,
        level: LogLevel,
        message: impl Into<String>,
        node_id: Option<NodeId>,
        data: Option<JsonValue>,
    ) {
        if self.append_unoffered(level, message, node_id, data) && self.rules_enabled {
            if let Some(entry) = self.log.entries().last() {
                self.engine.rules.offer(RuleEvent {
                    execution_id: self.id,
                    definition: Arc::clone(&self.definition),
                    entry: entry.clone(),
                    context: self.context.clone(),
                    reply: self.tx.clone(),
                });
            }
        }
    }

    /// Appends an entry without offering it to the rule engine. Returns
    /// false once the instance is terminal.
    fn append_unoffered(
        &mut self,
        level: LogLevel,
        message: impl Into<String>,
        node_id: Option<NodeId>,
        data: Option<JsonValue>,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let now = self.engine.clock.now();
        self.log.append(now, level, message, node_id, data);
        true
    }

    fn cancel(&mut self) {
        info!(execution_id = %self.id, "execution cancelled");
        let node_id = self.frontier.active().first().map(|o| o.node_id.clone());
        self.append(LogLevel::Warning, "Execution cancelled", node_id, None);
        self.finish(ExecutionStatus::Cancelled);
    }

    fn fail(&mut self, failure: ExecutionFailure) {
        if self.status.is_terminal() {
            return;
        }
        error!(execution_id = %self.id, %failure, "execution failed");
        let node_id = failure
            .node_id()
            .cloned()
            .or_else(|| self.frontier.active().first().map(|o| o.node_id.clone()));
        let data = serde_json::to_value(&failure).ok();
        self.append(LogLevel::Error, failure.to_string(), node_id, data);
        self.failure = Some(failure);
        self.finish(ExecutionStatus::Failed);
    }

    fn finish(&mut self, status: ExecutionStatus) {
        for child in self.frontier.running_children() {
            self.engine.send(child, InstanceMessage::Cancel);
        }
        self.status = status;
        self.ended_at = Some(self.engine.clock.now());
        self.steps.clear();
        self.held.clear();
        self.frontier.clear_active();
        if status == ExecutionStatus::Completed {
            info!(execution_id = %self.id, entries = self.log.len(), "execution completed");
        }
    }

    fn progress(&self) -> u8 {
        if self.status == ExecutionStatus::Completed {
            return 100;
        }
        let total = self.graph.node_count().max(1);
        let done = self.frontier.completed_count().min(total);
        u8::try_from(done * 100 / total).unwrap_or(100)
    }

    fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            id: self.id,
            flow_id: self.flow_id(),
            flow_version: self.definition.version,
            origin: self.origin.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            active: self.frontier.active(),
            context: self.context.clone(),
            progress: self.progress(),
            log: self.log.clone(),
            failure: self.failure.clone(),
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(Arc::new(self.snapshot()));
    }

    fn shutdown(self) {
        self.engine.forget(self.id);
        let snapshot = Arc::clone(&self.snapshots.borrow());
        info!(
            execution_id = %self.id,
            status = %snapshot.status,
            entries = snapshot.log.len(),
            "execution actor stopped"
        );
        if let Some(parent) = self.parent {
            let _ = parent.tx.send(InstanceMessage::ChildFinished {
                occurrence: parent.occurrence,
                snapshot,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::edge::Edge;
    use crate::engine::Engine;
    use crate::memory::{
        AutoComplete, InMemoryTaskStore, InMemoryWorkflowStore, RecordingNotificationSender,
    };
    use crate::node::RetryPolicy;
    use crate::rule::{Rule, RuleAction, RulePriority, TaskPriority, ValidationOutcome};
    use crate::services::WorkflowStore;
    use std::collections::HashMap;

    const PATIENCE: Duration = Duration::from_secs(300);

    struct Harness {
        engine: Engine,
        store: Arc<InMemoryWorkflowStore>,
        tasks: Arc<InMemoryTaskStore>,
        notifier: Arc<RecordingNotificationSender>,
    }

    impl Harness {
        /// Tasks complete only when a test says so.
        fn manual() -> Self {
            Self::with(InMemoryTaskStore::new(), EngineConfig::default())
        }

        fn auto(auto_complete: AutoComplete) -> Self {
            Self::with(
                InMemoryTaskStore::auto_completing(auto_complete),
                EngineConfig::default(),
            )
        }

        fn with(tasks: InMemoryTaskStore, config: EngineConfig) -> Self {
            let store = Arc::new(InMemoryWorkflowStore::new());
            let tasks = Arc::new(tasks);
            let notifier = Arc::new(RecordingNotificationSender::new());
            let engine = Engine::builder(store.clone())
                .task_store(tasks.clone())
                .notifier(notifier.clone())
                .config(config)
                .build();
            Self {
                engine,
                store,
                tasks,
                notifier,
            }
        }

        async fn install(&self, mut definition: WorkflowDefinition) -> WorkflowId {
            definition.activate().expect("activate");
            self.store.create(definition).await.expect("create").id
        }

        async fn start(&self, definition: WorkflowDefinition, context: JsonValue) -> ExecutionId {
            let flow_id = self.install(definition).await;
            self.engine
                .execute_with(flow_id, context, ExecutionOrigin::Manual)
                .await
                .expect("execute")
        }

        async fn wait_until(
            &self,
            id: ExecutionId,
            mut done: impl FnMut(&ExecutionSnapshot) -> bool,
        ) -> Arc<ExecutionSnapshot> {
            let mut rx = self.engine.watch(id).expect("watch");
            let snapshot = tokio::time::timeout(PATIENCE, rx.wait_for(|snapshot| done(snapshot)))
                .await
                .expect("execution never reached the expected state")
                .expect("execution actor stopped");
            Arc::clone(&snapshot)
        }

        async fn waiting_on(&self, id: ExecutionId, node: &str, visit: u32) {
            let occurrence = Occurrence::new(NodeId::from(node), visit);
            self.wait_until(id, |snapshot| snapshot.active.contains(&occurrence))
                .await;
        }

        async fn finished(&self, id: ExecutionId) -> Arc<ExecutionSnapshot> {
            self.wait_until(id, ExecutionSnapshot::is_terminal).await
        }

        async fn complete(&self, id: ExecutionId, task: &str, output: JsonValue) {
            self.tasks
                .complete(task, Some(id), TaskOutcome::success(output))
                .await;
        }
    }

    fn messages(snapshot: &ExecutionSnapshot) -> Vec<&str> {
        snapshot
            .log
            .entries()
            .iter()
            .map(|entry| entry.message.as_str())
            .collect()
    }

    fn logged(snapshot: &ExecutionSnapshot, message: &str) -> bool {
        messages(snapshot).contains(&message)
    }

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("Linear")
            .with_node(Node::start("start"))
            .with_node(Node::task("a", "A", "t-a"))
            .with_node(Node::task("b", "B", "t-b"))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "a"))
            .with_edge(Edge::new("e2", "a", "b"))
            .with_edge(Edge::new("e3", "b", "end"))
    }

    /// start -> a -> end, waiting on a single task.
    fn single_task() -> WorkflowDefinition {
        WorkflowDefinition::new("Single")
            .with_node(Node::start("start"))
            .with_node(Node::task("a", "A", "t-a"))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "a"))
            .with_edge(Edge::new("e2", "a", "end"))
    }

    fn subprocess(child: WorkflowId, continue_on_error: bool) -> WorkflowDefinition {
        WorkflowDefinition::new("Parent")
            .with_node(Node::start("start"))
            .with_node(Node::new(
                "sub",
                "Sub",
                NodeConfig::Subprocess {
                    workflow: child,
                    continue_on_error,
                },
            ))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "sub"))
            .with_edge(Edge::new("e2", "sub", "end"))
    }

    #[tokio::test]
    async fn linear_flow_logs_each_node_once() {
        let h = Harness::auto(AutoComplete::default());
        let id = h.start(linear(), JsonValue::Null).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert_eq!(snapshot.progress, 100);
        assert!(snapshot.active.is_empty());
        assert!(snapshot.ended_at.is_some());
        assert_eq!(
            messages(&snapshot),
            vec![
                "Workflow started",
                "Task 'A' completed",
                "Task 'B' completed",
                "Reached end 'Done'",
            ]
        );

        let entries = snapshot.log.entries();
        assert!(entries.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(entries[1].level, LogLevel::Success);
        assert_eq!(entries[1].node_id, Some(NodeId::from("a")));
        assert_eq!(entries[1].data.as_ref().map(|d| d["attempt"].clone()), Some(json!(1)));
    }

    #[tokio::test]
    async fn log_delta_returns_newer_entries() {
        let h = Harness::auto(AutoComplete::default());
        let id = h.start(linear(), JsonValue::Null).await;
        h.finished(id).await;

        let delta = h.engine.log_delta(id, 2).expect("delta");
        assert_eq!(delta.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4]);
        assert!(h.engine.log_delta(id, 4).expect("delta").is_empty());
    }

    #[tokio::test]
    async fn task_output_is_merged_into_context() {
        let h = Harness::auto(AutoComplete {
            outputs: HashMap::from([
                (TaskId::from("t-a"), json!({ "score": 7 })),
                (TaskId::from("t-b"), json!("plain")),
            ]),
            ..AutoComplete::default()
        });
        let id = h.start(linear(), json!({ "customer": "acme" })).await;

        let snapshot = h.finished(id).await;
        assert_eq!(
            snapshot.context,
            json!({ "customer": "acme", "score": 7, "b": "plain" })
        );
    }

    fn branching(else_branch: bool) -> WorkflowDefinition {
        let to_c = if else_branch {
            Edge::new("small", "check", "c")
        } else {
            Edge::conditional("small", "check", "c", "x < 0")
        };
        WorkflowDefinition::new("Branching")
            .with_node(Node::start("start"))
            .with_node(Node::decision("check", "Check", Vec::new()))
            .with_node(Node::task("b", "B", "t-b"))
            .with_node(Node::task("c", "C", "t-c"))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "check"))
            .with_edge(Edge::conditional("big", "check", "b", "x > 5"))
            .with_edge(to_c)
            .with_edge(Edge::new("b-end", "b", "end"))
            .with_edge(Edge::new("c-end", "c", "end"))
    }

    #[tokio::test]
    async fn decision_follows_first_matching_branch() {
        let h = Harness::auto(AutoComplete::default());
        let id = h.start(branching(true), json!({ "x": 10 })).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert!(logged(&snapshot, "Decision 'Check' took edge big"));
        assert!(logged(&snapshot, "Task 'B' completed"));
        assert!(!logged(&snapshot, "Task 'C' completed"));
        assert!(logged(&snapshot, "Reached end 'Done'"));

        let activated: Vec<_> = h.tasks.activations().await.into_iter().map(|(t, _)| t).collect();
        assert_eq!(activated, vec![TaskId::from("t-b")]);
    }

    #[tokio::test]
    async fn decision_falls_back_to_else_branch() {
        let h = Harness::auto(AutoComplete::default());
        let id = h.start(branching(true), json!({ "x": 1 })).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert!(logged(&snapshot, "Decision 'Check' took edge small"));
        assert!(logged(&snapshot, "Task 'C' completed"));
        assert!(!logged(&snapshot, "Task 'B' completed"));
    }

    #[tokio::test]
    async fn unmatched_decision_fails_the_execution() {
        let h = Harness::auto(AutoComplete::default());
        let id = h.start(branching(false), json!({ "x": 3 })).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Failed);
        assert_eq!(
            snapshot.failure,
            Some(ExecutionFailure::UnmatchedDecision {
                node_id: NodeId::from("check")
            })
        );

        let last = snapshot.log.entries().last().expect("entry");
        assert_eq!(last.level, LogLevel::Error);
        assert!(last.message.starts_with("UnmatchedDecisionError"));
        assert_eq!(last.node_id, Some(NodeId::from("check")));
        assert!(h.tasks.activations().await.is_empty());
    }

    #[tokio::test]
    async fn and_join_waits_for_every_branch() {
        let h = Harness::manual();
        let definition = WorkflowDefinition::new("Fan out")
            .with_node(Node::start("start"))
            .with_node(Node::task("a", "A", "t-a"))
            .with_node(Node::task("b", "B", "t-b"))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::parallel("to-a", "start", "a"))
            .with_edge(Edge::parallel("to-b", "start", "b"))
            .with_edge(Edge::new("a-end", "a", "end"))
            .with_edge(Edge::new("b-end", "b", "end"));
        let id = h.start(definition, JsonValue::Null).await;

        h.waiting_on(id, "a", 1).await;
        h.waiting_on(id, "b", 1).await;
        h.complete(id, "t-a", json!({})).await;

        let snapshot = h
            .wait_until(id, |s| logged(s, "Task 'A' completed"))
            .await;
        assert_eq!(snapshot.status, ExecutionStatus::Running);
        assert!(!logged(&snapshot, "Reached end 'Done'"));
        assert_eq!(snapshot.active, vec![Occurrence::new(NodeId::from("b"), 1)]);

        h.complete(id, "t-b", json!({})).await;
        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert_eq!(
            messages(&snapshot)
                .iter()
                .filter(|m| **m == "Reached end 'Done'")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn approval_loop_revisits_review() {
        let h = Harness::manual();
        let definition = WorkflowDefinition::new("Approval")
            .with_node(Node::start("start"))
            .with_node(Node::task("review", "Review", "t-review"))
            .with_node(Node::decision("decide", "Approved?", Vec::new()))
            .with_node(Node::task("revise", "Revise", "t-revise"))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "review"))
            .with_edge(Edge::new("e2", "review", "decide"))
            .with_edge(Edge::conditional("approved", "decide", "end", "approved"))
            .with_edge(Edge::new("rejected", "decide", "revise"))
            .with_edge(Edge::new("back", "revise", "review"));
        let id = h.start(definition, JsonValue::Null).await;

        h.waiting_on(id, "review", 1).await;
        h.complete(id, "t-review", json!({ "approved": false })).await;
        h.waiting_on(id, "revise", 1).await;
        h.complete(id, "t-revise", json!({})).await;
        h.waiting_on(id, "review", 2).await;
        h.complete(id, "t-review", json!({ "approved": true })).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert_eq!(
            messages(&snapshot),
            vec![
                "Workflow started",
                "Task 'Review' completed",
                "Decision 'Approved?' took edge rejected",
                "Task 'Revise' completed",
                "Task 'Review' completed",
                "Decision 'Approved?' took edge approved",
                "Reached end 'Done'",
            ]
        );
        let visits: Vec<_> = snapshot
            .log
            .entries()
            .iter()
            .filter(|e| e.message == "Task 'Review' completed")
            .filter_map(|e| e.data.as_ref().map(|d| d["visit"].clone()))
            .collect();
        assert_eq!(visits, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn runaway_loop_hits_step_limit() {
        let config = EngineConfig {
            max_steps_per_transition: 50,
            ..EngineConfig::default()
        };
        let h = Harness::with(InMemoryTaskStore::new(), config);
        let definition = WorkflowDefinition::new("Spin")
            .with_node(Node::start("start"))
            .with_node(Node::decision("spin", "Spin", Vec::new()))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "spin"))
            .with_edge(Edge::conditional("again", "spin", "spin", "forever"))
            .with_edge(Edge::new("out", "spin", "end"));
        let id = h.start(definition, json!({ "forever": true })).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Failed);
        assert_eq!(
            snapshot.failure,
            Some(ExecutionFailure::StepLimitExceeded { limit: 50 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_pending_timer() {
        let h = Harness::manual();
        let definition = WorkflowDefinition::new("Slow")
            .with_node(Node::start("start"))
            .with_node(Node::wait("hold", "Hold", Duration::from_secs(3600)))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "hold"))
            .with_edge(Edge::new("e2", "hold", "end"));
        let id = h.start(definition, JsonValue::Null).await;

        h.waiting_on(id, "hold", 1).await;
        h.engine.cancel(id).expect("cancel");

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Cancelled);
        assert_eq!(
            messages(&snapshot),
            vec!["Workflow started", "Execution cancelled"]
        );
        assert!(snapshot.active.is_empty());

        tokio::time::advance(Duration::from_secs(7200)).await;
        tokio::task::yield_now().await;
        let after = h.engine.status(id).expect("status");
        assert_eq!(after.status, ExecutionStatus::Cancelled);
        assert_eq!(after.log.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_node_resumes_after_its_duration() {
        let h = Harness::manual();
        let definition = WorkflowDefinition::new("Cool down")
            .with_node(Node::start("start"))
            .with_node(Node::wait("cool", "Cool down", Duration::from_secs(30)))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "cool"))
            .with_edge(Edge::new("e2", "cool", "end"));
        let started = tokio::time::Instant::now();
        let id = h.start(definition, JsonValue::Null).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(logged(&snapshot, "Wait 'Cool down' finished"));
    }

    #[tokio::test(start_paused = true)]
    async fn maximum_duration_fails_with_timeout() {
        let h = Harness::manual();
        let mut definition = single_task();
        definition.settings.max_duration_secs = Some(60);
        let id = h.start(definition, JsonValue::Null).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Failed);
        assert_eq!(
            snapshot.failure,
            Some(ExecutionFailure::Timeout {
                max_duration_ms: 60_000
            })
        );
        let last = snapshot.log.entries().last().expect("entry");
        assert_eq!(last.level, LogLevel::Error);
        assert!(last.message.starts_with("TimeoutError"));
    }

    fn retrying() -> WorkflowDefinition {
        WorkflowDefinition::new("Flaky")
            .with_node(Node::start("start"))
            .with_node(Node::new(
                "a",
                "A",
                NodeConfig::Task {
                    task: TaskId::from("t-a"),
                    retry: Some(
                        RetryPolicy::new(3).with_initial_backoff(Duration::from_millis(100)),
                    ),
                },
            ))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "a"))
            .with_edge(Edge::new("e2", "a", "end"))
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_the_execution() {
        let h = Harness::auto(AutoComplete {
            failing: [TaskId::from("t-a")].into_iter().collect(),
            ..AutoComplete::default()
        });
        let id = h.start(retrying(), JsonValue::Null).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Failed);
        assert!(matches!(
            &snapshot.failure,
            Some(ExecutionFailure::TaskFailure { attempts: 3, node_id, .. }) if node_id.as_str() == "a"
        ));

        let warnings: Vec<_> = snapshot
            .log
            .entries()
            .iter()
            .filter(|e| e.level == LogLevel::Warning)
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(
            warnings,
            vec![
                "Task 'A' failed (attempt 1/3): task t-a failed; retrying in 100ms",
                "Task 'A' failed (attempt 2/3): task t-a failed; retrying in 200ms",
            ]
        );
        assert_eq!(h.tasks.activations().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_a_later_attempt() {
        let h = Harness::manual();
        let id = h.start(retrying(), JsonValue::Null).await;

        h.waiting_on(id, "a", 1).await;
        h.tasks
            .complete("t-a", Some(id), TaskOutcome::failure("flaky"))
            .await;
        tokio::time::timeout(PATIENCE, async {
            while h.tasks.activations().await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task re-activated");
        h.complete(id, "t-a", json!({})).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        let completed = snapshot
            .log
            .entries()
            .iter()
            .find(|e| e.message == "Task 'A' completed")
            .expect("completion entry");
        assert_eq!(completed.data.as_ref().map(|d| d["attempt"].clone()), Some(json!(2)));
    }

    #[tokio::test]
    async fn completions_wait_while_paused() {
        let h = Harness::manual();
        let id = h.start(single_task(), JsonValue::Null).await;

        h.waiting_on(id, "a", 1).await;
        h.engine.pause(id).expect("pause");
        h.wait_until(id, |s| s.status == ExecutionStatus::Paused)
            .await;
        h.complete(id, "t-a", json!({})).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let paused = h.engine.status(id).expect("status");
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert!(!logged(&paused, "Task 'A' completed"));

        h.engine.resume(id).expect("resume");
        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert_eq!(
            messages(&snapshot),
            vec![
                "Workflow started",
                "Execution paused",
                "Execution resumed",
                "Task 'A' completed",
                "Reached end 'Done'",
            ]
        );
    }

    #[tokio::test]
    async fn notification_payload_is_rendered_from_context() {
        let h = Harness::manual();
        let definition = WorkflowDefinition::new("Notify")
            .with_node(Node::start("start"))
            .with_node(Node::new(
                "notify",
                "Shipped",
                NodeConfig::Notification {
                    notification_type: "email".to_string(),
                    recipients: vec!["ops@example.com".to_string()],
                    template: json!({
                        "subject": "Order {{order.id}} shipped",
                        "total": "{{order.total}}",
                    }),
                },
            ))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "notify"))
            .with_edge(Edge::new("e2", "notify", "end"));
        let id = h
            .start(definition, json!({ "order": { "id": "A-1", "total": 12.5 } }))
            .await;

        let snapshot = h.finished(id).await;
        assert!(logged(&snapshot, "Notification 'Shipped' sent"));

        let sent = tokio::time::timeout(PATIENCE, async {
            loop {
                let sent = h.notifier.sent().await;
                if !sent.is_empty() {
                    break sent;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("notification sent");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, "email");
        assert_eq!(sent[0].recipients, vec!["ops@example.com".to_string()]);
        assert_eq!(
            sent[0].payload,
            json!({ "subject": "Order A-1 shipped", "total": 12.5 })
        );
    }

    #[tokio::test]
    async fn subprocess_output_flows_back_to_parent() {
        let h = Harness::auto(AutoComplete {
            outputs: HashMap::from([(TaskId::from("t-child"), json!({ "child_done": true }))]),
            ..AutoComplete::default()
        });
        // Subprocess targets do not have to be active.
        let child = WorkflowDefinition::new("Child")
            .with_node(Node::start("start"))
            .with_node(Node::task("work", "Work", "t-child"))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "work"))
            .with_edge(Edge::new("e2", "work", "end"));
        let child_id = h.store.create(child).await.expect("create").id;

        let id = h.start(subprocess(child_id, false), json!({ "order": 7 })).await;
        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert_eq!(snapshot.context, json!({ "order": 7, "child_done": true }));
        assert!(logged(&snapshot, "Subprocess 'Sub' completed"));

        let (_, child_execution) = h
            .tasks
            .activations()
            .await
            .into_iter()
            .find(|(task, _)| task.as_str() == "t-child")
            .expect("child task activated");
        let child_snapshot = h.engine.status(child_execution).expect("child status");
        assert_eq!(child_snapshot.flow_id, child_id);
        assert_eq!(
            child_snapshot.origin,
            ExecutionOrigin::Subprocess {
                parent: id,
                node_id: NodeId::from("sub"),
            }
        );
        assert_eq!(child_snapshot.context["order"], 7);
    }

    async fn failing_child(h: &Harness) -> WorkflowId {
        let child = WorkflowDefinition::new("Child")
            .with_node(Node::start("start"))
            .with_node(Node::task("work", "Work", "t-child"))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "work"))
            .with_edge(Edge::new("e2", "work", "end"));
        h.store.create(child).await.expect("create").id
    }

    #[tokio::test]
    async fn failed_subprocess_fails_parent() {
        let h = Harness::auto(AutoComplete {
            failing: [TaskId::from("t-child")].into_iter().collect(),
            ..AutoComplete::default()
        });
        let child_id = failing_child(&h).await;
        let id = h.start(subprocess(child_id, false), JsonValue::Null).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Failed);
        assert!(matches!(
            &snapshot.failure,
            Some(ExecutionFailure::SubprocessFailure { child: Some(_), reason, .. })
                if reason.starts_with("TaskFailure")
        ));
    }

    #[tokio::test]
    async fn failed_subprocess_can_be_tolerated() {
        let h = Harness::auto(AutoComplete {
            failing: [TaskId::from("t-child")].into_iter().collect(),
            ..AutoComplete::default()
        });
        let child_id = failing_child(&h).await;
        let id = h.start(subprocess(child_id, true), JsonValue::Null).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        let warning = snapshot
            .log
            .entries()
            .iter()
            .find(|e| e.level == LogLevel::Warning)
            .expect("warning entry");
        assert!(warning.message.starts_with("Subprocess 'Sub' failed, continuing: TaskFailure"));
        assert!(logged(&snapshot, "Reached end 'Done'"));
    }

    #[tokio::test]
    async fn recursive_subprocess_is_bounded() {
        let config = EngineConfig {
            max_subprocess_depth: 3,
            ..EngineConfig::default()
        };
        let h = Harness::with(InMemoryTaskStore::new(), config);
        let mut definition = WorkflowDefinition::new("Recursive");
        let own_id = definition.id;
        definition = definition
            .with_node(Node::start("start"))
            .with_node(Node::new(
                "sub",
                "Sub",
                NodeConfig::Subprocess {
                    workflow: own_id,
                    continue_on_error: false,
                },
            ))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "sub"))
            .with_edge(Edge::new("e2", "sub", "end"));
        let id = h.start(definition, JsonValue::Null).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Failed);
        let Some(ExecutionFailure::SubprocessFailure { reason, .. }) = &snapshot.failure else {
            panic!("expected a subprocess failure, got {:?}", snapshot.failure);
        };
        assert!(reason.contains("maximum subprocess depth of 3 exceeded"));
    }

    fn warn_rule(name: &str, condition: &str, message: &str) -> Rule {
        Rule::new(
            name,
            condition,
            RuleAction::Validation(ValidationOutcome::Warn {
                message: message.to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn validation_rule_rejects_execution() {
        let h = Harness::manual();
        let definition = single_task().with_rule(Rule::new(
            "limit",
            r#"log.message == "Workflow started" && amount > 100"#,
            RuleAction::Validation(ValidationOutcome::Fail {
                reason: "amount {{amount}} too large".to_string(),
            }),
        ));
        let id = h.start(definition, json!({ "amount": 500 })).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Failed);
        assert_eq!(
            snapshot.failure,
            Some(ExecutionFailure::RuleRejected {
                rule: "limit".to_string(),
                reason: "amount 500 too large".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn warning_rule_appends_entry() {
        let h = Harness::manual();
        let definition = single_task().with_rule(warn_rule(
            "audit",
            r#"log.message == "Workflow started""#,
            "started for {{customer}}",
        ));
        let id = h.start(definition, json!({ "customer": "acme" })).await;

        let snapshot = h
            .wait_until(id, |s| logged(s, "Rule 'audit': started for acme"))
            .await;
        assert_eq!(snapshot.status, ExecutionStatus::Running);
        let entry = snapshot.log.entries().last().expect("entry");
        assert_eq!(entry.level, LogLevel::Warning);

        h.waiting_on(id, "a", 1).await;
        h.complete(id, "t-a", json!({})).await;
        assert_eq!(h.finished(id).await.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn higher_priority_rule_fires_first() {
        let h = Harness::manual();
        let definition = single_task()
            .with_rule(warn_rule("routine", r#"log.message == "Workflow started""#, "routine"))
            .with_rule(
                warn_rule("urgent", r#"log.message == "Workflow started""#, "urgent")
                    .with_priority(RulePriority::High),
            );
        let id = h.start(definition, JsonValue::Null).await;

        let snapshot = h
            .wait_until(id, |s| logged(s, "Rule 'urgent': urgent"))
            .await;
        assert!(!logged(&snapshot, "Rule 'routine': routine"));
    }

    #[tokio::test]
    async fn automation_rule_creates_task() {
        let h = Harness::manual();
        let definition = single_task().with_rule(Rule::new(
            "follow-up",
            r#"log.message == "Workflow started""#,
            RuleAction::Automation {
                title: "Review order {{order}}".to_string(),
                assignee: Some("ops".to_string()),
                priority: TaskPriority::High,
            },
        ));
        let id = h.start(definition, json!({ "order": 42 })).await;

        let created = tokio::time::timeout(PATIENCE, async {
            loop {
                let created = h.tasks.created().await;
                if !created.is_empty() {
                    break created;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task created");
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].title, "Review order 42");
        assert_eq!(created[0].assignee.as_deref(), Some("ops"));
        assert_eq!(created[0].priority, TaskPriority::High);
        assert_eq!(created[0].execution_id, Some(id));
    }

    #[tokio::test]
    async fn disabled_rules_never_fire() {
        let h = Harness::auto(AutoComplete::default());
        let mut rule = Rule::new(
            "always",
            "true",
            RuleAction::Validation(ValidationOutcome::Fail {
                reason: "never".to_string(),
            }),
        );
        rule.enabled = false;
        let id = h.start(linear().with_rule(rule), JsonValue::Null).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert!(snapshot.failure.is_none());
    }

    #[tokio::test]
    async fn branch_join_inside_loop_resets_each_iteration() {
        let h = Harness::manual();
        let definition = WorkflowDefinition::new("Triage")
            .with_node(Node::start("start"))
            .with_node(Node::task("review", "Review", "t-review"))
            .with_node(Node::decision("route", "Urgent?", Vec::new()))
            .with_node(Node::task("fast", "Fast", "t-fast"))
            .with_node(Node::task("slow", "Slow", "t-slow"))
            .with_node(Node::decision("check", "Done?", Vec::new()))
            .with_node(Node::end("end", "Done"))
            .with_edge(Edge::new("e1", "start", "review"))
            .with_edge(Edge::new("e2", "review", "route"))
            .with_edge(Edge::conditional("urgent", "route", "fast", "urgent"))
            .with_edge(Edge::new("normal", "route", "slow"))
            .with_edge(Edge::new("fast-check", "fast", "check"))
            .with_edge(Edge::new("slow-check", "slow", "check"))
            .with_edge(Edge::conditional("finish", "check", "end", "done"))
            .with_edge(Edge::new("again", "check", "review"));
        let id = h.start(definition, json!({ "urgent": true })).await;

        h.waiting_on(id, "review", 1).await;
        h.complete(id, "t-review", json!({ "done": false })).await;
        h.waiting_on(id, "fast", 1).await;
        h.complete(id, "t-fast", json!({})).await;
        h.waiting_on(id, "review", 2).await;
        h.complete(id, "t-review", json!({ "done": true })).await;
        h.waiting_on(id, "fast", 2).await;
        h.complete(id, "t-fast", json!({})).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert!(snapshot.failure.is_none());
        assert_eq!(
            messages(&snapshot)
                .iter()
                .filter(|m| **m == "Decision 'Done?' took edge again")
                .count(),
            1
        );
        assert!(logged(&snapshot, "Decision 'Done?' took edge finish"));
        assert!(!logged(&snapshot, "Task 'Slow' completed"));
        assert!(logged(&snapshot, "Reached end 'Done'"));
    }

    #[tokio::test]
    async fn running_execution_keeps_its_definition_version() {
        let h = Harness::manual();
        let id = h.start(single_task(), JsonValue::Null).await;
        h.waiting_on(id, "a", 1).await;

        let flow_id = h.engine.status(id).expect("status").flow_id;
        let mut edited = h.store.get(flow_id).await.expect("get");
        edited.edges.retain(|e| e.id.as_str() != "e2");
        edited = edited
            .with_node(Node::task("b", "B", "t-b"))
            .with_edge(Edge::new("a-b", "a", "b"))
            .with_edge(Edge::new("b-end", "b", "end"));
        let updated = h.store.update(edited, 1).await.expect("update");
        assert_eq!(updated.version, 2);

        h.complete(id, "t-a", json!({})).await;
        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert_eq!(snapshot.flow_version, 1);
        assert!(logged(&snapshot, "Reached end 'Done'"));
        assert!(!logged(&snapshot, "Task 'B' completed"));

        let activated: Vec<_> = h.tasks.activations().await.into_iter().map(|(t, _)| t).collect();
        assert_eq!(activated, vec![TaskId::from("t-a")]);
    }

    #[tokio::test]
    async fn start_ignores_edge_conditions() {
        let h = Harness::auto(AutoComplete::default());
        let mut definition = single_task();
        definition.edges.retain(|e| e.id.as_str() != "e1");
        definition = definition.with_edge(Edge::conditional("e1", "start", "a", "ready"));
        let id = h.start(definition, json!({ "ready": false })).await;

        let snapshot = h.finished(id).await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert!(logged(&snapshot, "Task 'A' completed"));
        assert!(logged(&snapshot, "Reached end 'Done'"));
    }
}
