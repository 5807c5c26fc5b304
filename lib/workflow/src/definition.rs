//! Workflow definition types.
//!
//! A workflow definition is an explicit, serializable value: metadata, the
//! ordered node list, edges, triggers and rules, plus a monotonic `version`
//! bumped on every edit. Executions freeze a copy of the definition at the
//! version they started with.

use crate::edge::Edge;
use crate::error::WorkflowError;
use crate::node::{Node, NodeKind};
use crate::rule::Rule;
use crate::trigger::Trigger;
use crate::validate::{self, ValidationReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use taskflow_core::{NodeId, WorkflowId};

/// Informational shape of a flow. The engine itself is generic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    #[default]
    Sequential,
    Parallel,
    Conditional,
    Mixed,
}

/// Lifecycle status of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Being authored; not triggerable.
    #[default]
    Draft,
    /// Validated and triggerable.
    Active,
    /// Temporarily not triggerable.
    Paused,
    /// Finished its purpose; kept for reference.
    Completed,
    /// Retired.
    Archived,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Archived => "archived",
        };
        f.write_str(name)
    }
}

/// Metadata for a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// Description of what this workflow does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tags for organization/filtering.
    #[serde(default)]
    pub tags: Vec<String>,
    /// When this workflow was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When this workflow was last updated.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for WorkflowMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            description: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-definition execution settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Maximum wall-clock duration of an execution, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
}

impl ExecutionSettings {
    /// Returns the maximum duration, if configured.
    #[must_use]
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique identifier.
    #[serde(default)]
    pub id: WorkflowId,
    /// Human-readable name.
    pub name: String,
    /// Informational flow type.
    #[serde(default, rename = "type")]
    pub flow_type: FlowType,
    /// Lifecycle status.
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Ordered nodes.
    pub nodes: Vec<Node>,
    /// Edges.
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Triggers.
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Rules.
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Metadata.
    #[serde(default)]
    pub metadata: WorkflowMetadata,
    /// Execution settings.
    #[serde(default)]
    pub settings: ExecutionSettings,
    /// Monotonic version, bumped on every edit.
    #[serde(default = "initial_version")]
    pub version: u64,
}

fn initial_version() -> u64 {
    1
}

impl WorkflowDefinition {
    /// Creates an empty draft definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            flow_type: FlowType::default(),
            status: WorkflowStatus::Draft,
            nodes: Vec::new(),
            edges: Vec::new(),
            triggers: Vec::new(),
            rules: Vec::new(),
            metadata: WorkflowMetadata::default(),
            settings: ExecutionSettings::default(),
            version: initial_version(),
        }
    }

    /// Adds a node (builder style).
    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Adds an edge (builder style).
    #[must_use]
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Adds a trigger (builder style).
    #[must_use]
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Adds a rule (builder style).
    #[must_use]
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Returns the node with the given id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Returns the single start node, if exactly one exists.
    #[must_use]
    pub fn start_node(&self) -> Option<&Node> {
        let mut starts = self.nodes.iter().filter(|n| n.kind() == NodeKind::Start);
        let first = starts.next()?;
        starts.next().is_none().then_some(first)
    }

    /// Validates the definition.
    ///
    /// # Errors
    ///
    /// Returns every violated structural invariant.
    pub fn validate(&self) -> Result<(), ValidationReport> {
        validate::validate(self)
    }

    /// Returns whether the definition can currently be triggered.
    #[must_use]
    pub fn is_triggerable(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    /// Applies an edit and bumps the version.
    ///
    /// # Errors
    ///
    /// Archived definitions cannot be edited.
    pub fn edit(&mut self, change: impl FnOnce(&mut Self)) -> Result<(), WorkflowError> {
        if self.status == WorkflowStatus::Archived {
            return Err(WorkflowError::NotEditable {
                workflow_id: self.id,
                status: self.status,
            });
        }
        change(self);
        self.touch();
        Ok(())
    }

    /// Bumps the version and the update timestamp.
    pub fn touch(&mut self) {
        self.version += 1;
        self.metadata.updated_at = Utc::now();
    }

    /// Validates and transitions to `active`.
    ///
    /// # Errors
    ///
    /// Fails when the definition is invalid or the transition is not allowed.
    pub fn activate(&mut self) -> Result<(), WorkflowError> {
        self.validate().map_err(|report| WorkflowError::Invalid {
            workflow_id: self.id,
            report,
        })?;
        self.transition(WorkflowStatus::Active)
    }

    /// Transitions `active` to `paused`.
    ///
    /// # Errors
    ///
    /// Fails when the definition is not active.
    pub fn pause(&mut self) -> Result<(), WorkflowError> {
        self.transition(WorkflowStatus::Paused)
    }

    /// Transitions `paused` back to `active`, re-validating the graph.
    ///
    /// # Errors
    ///
    /// Fails when the definition is not paused or no longer valid.
    pub fn resume(&mut self) -> Result<(), WorkflowError> {
        if self.status != WorkflowStatus::Paused {
            return Err(WorkflowError::InvalidStateTransition {
                from: self.status,
                to: WorkflowStatus::Active,
            });
        }
        self.activate()
    }

    /// Marks the definition completed.
    ///
    /// # Errors
    ///
    /// Fails when the transition is not allowed.
    pub fn complete(&mut self) -> Result<(), WorkflowError> {
        self.transition(WorkflowStatus::Completed)
    }

    /// Retires the definition.
    ///
    /// # Errors
    ///
    /// Fails when the definition is already archived.
    pub fn archive(&mut self) -> Result<(), WorkflowError> {
        self.transition(WorkflowStatus::Archived)
    }

    fn transition(&mut self, to: WorkflowStatus) -> Result<(), WorkflowError> {
        use WorkflowStatus::{Active, Archived, Completed, Draft, Paused};

        let allowed = matches!(
            (self.status, to),
            (Draft | Paused, Active)
                | (Active, Paused)
                | (Active | Paused, Completed)
                | (Draft | Active | Paused | Completed, Archived)
        );
        if !allowed {
            return Err(WorkflowError::InvalidStateTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.metadata.updated_at = Utc::now();
        Ok(())
    }
}

/// Summary information about a workflow (for listings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Workflow ID.
    pub id: WorkflowId,
    /// Workflow name.
    pub name: String,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Current version.
    pub version: u64,
    /// Number of nodes.
    pub node_count: usize,
    /// Last updated timestamp.
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowDefinition> for WorkflowSummary {
    fn from(definition: &WorkflowDefinition) -> Self {
        Self {
            id: definition.id,
            name: definition.name.clone(),
            status: definition.status,
            version: definition.version,
            node_count: definition.nodes.len(),
            updated_at: definition.metadata.updated_at,
        }
    }
}
