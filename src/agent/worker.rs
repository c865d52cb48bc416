//! The domain-specific half of an agent

use crate::agent::task::{AgentContext, AgentTask, ProcessOutput};
use crate::error::AgentError;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Work an [`Agent`](crate::agent::Agent) wraps with its execution contract
///
/// Implementations only do the work; timeouts, notifications, concurrency
/// limits and failure conversion are handled by `Agent::execute`.
#[async_trait]
pub trait AgentWorker: Send + Sync {
    /// Agent type this worker serves
    fn agent_type(&self) -> &str;

    /// Model reported as `model_used` in result metadata
    fn model_name(&self) -> Option<String> {
        None
    }

    fn can_handle(&self, task: &AgentTask) -> bool {
        task.task_type == self.agent_type()
    }

    fn validate_input(&self, _input: &Value) -> Result<(), AgentError> {
        Ok(())
    }

    /// Run the work. `cancel` fires when the call timed out; long-running
    /// implementations should stop at their next await point.
    async fn process(
        &self,
        input: &Value,
        context: &AgentContext,
        cancel: CancellationToken,
    ) -> Result<ProcessOutput, AgentError>;

    async fn health_check(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn shutdown(&self) {}
}
