//! Task and result types exchanged between the pipeline and agents

use crate::email::Email;
use crate::error::AgentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Scheduling priority of a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// A unit of work handed to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: Uuid,
    pub task_type: String,
    pub input: Value,
    #[serde(default)]
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    /// Overrides the agent's configured timeout when set
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Unset means the executing agent's `retry_attempts` applies
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub current_retries: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl AgentTask {
    pub fn new(task_type: impl Into<String>, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            input,
            priority: TaskPriority::Normal,
            created_at: Utc::now(),
            timeout: None,
            max_retries: None,
            current_retries: 0,
            dependencies: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn retry_budget(&self) -> u32 {
        self.max_retries.unwrap_or(0)
    }

    pub fn can_retry(&self) -> bool {
        self.current_retries < self.retry_budget()
    }

    /// Count one more retry, refusing to go past `max_retries`
    pub fn record_retry(&mut self) -> Result<u32, AgentError> {
        if !self.can_retry() {
            return Err(AgentError::validation(format!(
                "task {} exhausted its {} retries",
                self.id,
                self.retry_budget()
            )));
        }
        self.current_retries += 1;
        Ok(self.current_retries)
    }
}

/// Outcome category of one agent invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Success,
    Failure,
    NeedsReview,
}

/// Outcome of one agent invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResult {
    pub agent_id: String,
    pub agent_type: String,
    pub status: AgentStatus,
    /// In [0, 1]; always 0 for failures
    pub confidence: f64,
    /// Opaque payload; null for failures
    pub data: Value,
    pub reasoning: String,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl AgentResult {
    pub fn failure(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        reasoning: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            status: AgentStatus::Failure,
            confidence: 0.0,
            data: Value::Null,
            reasoning: reasoning.into(),
            processing_time_ms,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Anything other than an outright failure counts as a usable result
    pub fn is_success(&self) -> bool {
        self.status != AgentStatus::Failure
    }

    /// Error kind recorded in metadata by the agent boundary, if any
    pub fn error_kind(&self) -> Option<&str> {
        self.metadata.get("error_kind").and_then(Value::as_str)
    }
}

/// What a worker's `process` step produces
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    pub confidence: f64,
    pub data: Value,
    pub reasoning: String,
    pub metadata: HashMap<String, Value>,
}

impl ProcessOutput {
    pub fn new(confidence: f64, data: Value, reasoning: impl Into<String>) -> Self {
        Self {
            confidence,
            data,
            reasoning: reasoning.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Read-only view of the run an agent call belongs to
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub execution_id: Uuid,
    pub stage_id: String,
    pub email: Arc<Email>,
    /// Results of earlier stages keyed `<stageId>:<agentType>`
    pub previous_results: Arc<BTreeMap<String, AgentResult>>,
}

impl AgentContext {
    pub fn new(execution_id: Uuid, stage_id: impl Into<String>, email: Arc<Email>) -> Self {
        Self {
            execution_id,
            stage_id: stage_id.into(),
            email,
            previous_results: Arc::new(BTreeMap::new()),
        }
    }

    pub fn with_previous_results(mut self, results: BTreeMap<String, AgentResult>) -> Self {
        self.previous_results = Arc::new(results);
        self
    }
}
