//! Error taxonomy for agent execution and pipeline orchestration
//!
//! Agent-local failures (validation, timeout, execution) are converted into
//! failed [`AgentResult`](crate::agent::AgentResult) values at the agent
//! boundary. Only orchestration-level errors (unknown agent type, a fatal stage
//! failure, cancellation) travel as [`PipelineError`].

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by agents, workers and the orchestrator registry
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Agent execution timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("Agent type not found: {agent_type}")]
    NotFound { agent_type: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("LLM provider error: {0}")]
    Llm(#[from] crate::llm::LlmError),

    #[error("Agent call cancelled")]
    Cancelled,
}

impl AgentError {
    /// Create validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create execution error
    pub fn execution_failed<S: Into<String>>(message: S) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }

    /// Create agent-not-found error
    pub fn not_found<S: Into<String>>(agent_type: S) -> Self {
        Self::NotFound {
            agent_type: agent_type.into(),
        }
    }

    /// Create configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// The bare message without the variant prefix, sanitized for reporting
    pub fn detail(&self) -> String {
        let raw = match self {
            AgentError::Validation { message }
            | AgentError::ExecutionFailed { message }
            | AgentError::Configuration { message } => message.clone(),
            other => other.to_string(),
        };
        sanitize_error_message(&raw)
    }

    /// Short machine-readable kind used in result metadata
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Validation { .. } => "validation",
            AgentError::Timeout { .. } => "timeout",
            AgentError::ExecutionFailed { .. } => "execution",
            AgentError::NotFound { .. } => "not_found",
            AgentError::Configuration { .. } => "configuration",
            AgentError::Llm(_) => "llm",
            AgentError::Cancelled => "cancelled",
        }
    }
}

/// Errors surfaced by [`Pipeline`](crate::pipeline::Pipeline) operations
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Stage '{stage_id}' failed: {reason}")]
    StageFailed {
        stage_id: String,
        reason: String,
        failed_agents: Vec<String>,
    },

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Execution {0} was cancelled")]
    Cancelled(Uuid),

    #[error("Execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("Invalid state transition for execution {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl PipelineError {
    /// Stage id this error originated from, when it came from a stage
    pub fn stage_id(&self) -> Option<&str> {
        match self {
            PipelineError::StageFailed { stage_id, .. } => Some(stage_id),
            _ => None,
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Redact secrets and sensitive paths and cap the length of an error message
///
/// Applied to every error message that leaves the agent boundary as result
/// data, since agent results end up in logs and execution history.
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
