//! Starting executions on behalf of triggers.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use taskflow_core::{ExecutionId, WorkflowId};
use taskflow_workflow::engine::Engine;
use taskflow_workflow::execution::ExecutionOrigin;

/// Starts executions of a workflow.
#[async_trait]
pub trait ExecutionLauncher: Send + Sync {
    /// Starts an execution with an initial context.
    ///
    /// # Errors
    ///
    /// Returns a description of why the execution could not start.
    async fn launch(
        &self,
        workflow_id: WorkflowId,
        context: JsonValue,
        origin: ExecutionOrigin,
    ) -> Result<ExecutionId, String>;
}

#[async_trait]
impl ExecutionLauncher for Engine {
    async fn launch(
        &self,
        workflow_id: WorkflowId,
        context: JsonValue,
        origin: ExecutionOrigin,
    ) -> Result<ExecutionId, String> {
        self.execute_with(workflow_id, context, origin)
            .await
            .map_err(|report| report.current_context().to_string())
    }
}
