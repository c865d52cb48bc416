//! Agent execution notifications
//!
//! Observers receive start/success/failure events for every agent call. The
//! call path never waits on an observer: `notify` is synchronous and sinks that
//! need async work hand events off through a channel.

use crate::observability::metrics::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Pipeline execution the call belongs to
    pub execution_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: String,
    pub agent_type: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AgentEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEventKind {
    Started {
        input: Value,
    },
    Succeeded {
        confidence: f64,
        processing_time_ms: u64,
    },
    Failed {
        error: String,
        processing_time_ms: u64,
    },
}

/// Sink for agent execution notifications; must not block
pub trait ExecutionObserver: Send + Sync {
    fn notify(&self, event: &AgentEvent);
}

/// Writes every event as a structured log line
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn notify(&self, event: &AgentEvent) {
        match &event.kind {
            AgentEventKind::Started { .. } => info!(
                execution_id = %event.execution_id,
                task_id = %event.task_id,
                agent_id = %event.agent_id,
                agent_type = %event.agent_type,
                "Agent call started"
            ),
            AgentEventKind::Succeeded {
                confidence,
                processing_time_ms,
            } => info!(
                execution_id = %event.execution_id,
                task_id = %event.task_id,
                agent_id = %event.agent_id,
                confidence = confidence,
                processing_time_ms = processing_time_ms,
                "Agent call succeeded"
            ),
            AgentEventKind::Failed {
                error,
                processing_time_ms,
            } => warn!(
                execution_id = %event.execution_id,
                task_id = %event.task_id,
                agent_id = %event.agent_id,
                error = %error,
                processing_time_ms = processing_time_ms,
                "Agent call failed"
            ),
        }
    }
}

/// Forwards events into an unbounded channel; a closed receiver is ignored
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelObserver {
    pub fn new(sender: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self { sender }
    }

    /// Observer plus the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl ExecutionObserver for ChannelObserver {
    fn notify(&self, event: &AgentEvent) {
        let _ = self.sender.send(event.clone());
    }
}

/// Feeds agent outcomes into the global metrics collector
#[derive(Debug, Default)]
pub struct MetricsObserver;

impl ExecutionObserver for MetricsObserver {
    fn notify(&self, event: &AgentEvent) {
        let collector = metrics();
        match &event.kind {
            AgentEventKind::Started { .. } => collector.agent_call_started(),
            AgentEventKind::Succeeded {
                processing_time_ms, ..
            } => collector.agent_call_succeeded(*processing_time_ms),
            AgentEventKind::Failed {
                processing_time_ms, ..
            } => collector.agent_call_failed(*processing_time_ms),
        }
    }
}
