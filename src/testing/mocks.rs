//! Mock implementations for testing
//!
//! Provides a scripted reasoning provider, a scripted agent worker and an
//! observer that records every event, so pipelines can be exercised without a
//! network.

use crate::agent::events::{AgentEvent, AgentEventKind, ExecutionObserver};
use crate::agent::task::{AgentContext, ProcessOutput};
use crate::agent::worker::AgentWorker;
use crate::error::AgentError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, TokenUsage,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Mock LLM provider for testing
#[derive(Debug)]
pub struct MockLlmProvider {
    pub responses: Vec<String>,
    pub current_response: Arc<Mutex<usize>>,
    pub should_fail: bool,
    pub delay: Option<Duration>,
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockLlmProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            current_response: Arc::new(Mutex::new(0)),
            should_fail: false,
            delay: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Self::new(vec![])
        }
    }

    pub fn single_response(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    /// Every completion waits this long before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn recorded_requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn available_models(&self) -> Vec<String> {
        vec!["mock-model".to_string()]
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.requests.lock().await.push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.should_fail {
            return Err(LlmError::RequestFailed("Mock LLM failure".to_string()));
        }

        let mut current = self.current_response.lock().await;
        let content = if self.responses.is_empty() {
            "Mock response".to_string()
        } else {
            self.responses[*current % self.responses.len()].clone()
        };
        *current += 1;

        Ok(CompletionResponse {
            content: Some(content),
            model: request.model,
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            finish_reason: FinishReason::Stop,
            metadata: HashMap::new(),
        })
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        if self.should_fail {
            Err(LlmError::RequestFailed(
                "Mock health check failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

type Scripted = Result<ProcessOutput, String>;

/// Agent worker that replays scripted outcomes
///
/// Queued outcomes are consumed first; afterwards every call returns the
/// fallback outcome.
#[derive(Debug)]
pub struct ScriptedWorker {
    agent_type: String,
    queue: std::sync::Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    delay: Option<Duration>,
    reject_input: bool,
    healthy: AtomicBool,
    model: Option<String>,
    invocations: AtomicUsize,
    shutdowns: AtomicUsize,
    tokens: std::sync::Mutex<Vec<CancellationToken>>,
}

impl ScriptedWorker {
    pub fn new(agent_type: impl Into<String>) -> Self {
        let agent_type = agent_type.into();
        let fallback = Ok(ProcessOutput::new(
            0.8,
            json!({ "agent": agent_type }),
            format!("{agent_type} processed the email"),
        ));
        Self {
            agent_type,
            queue: std::sync::Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            reject_input: false,
            healthy: AtomicBool::new(true),
            model: None,
            invocations: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            tokens: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Every unscripted call succeeds with `output`
    pub fn with_output(mut self, output: ProcessOutput) -> Self {
        self.fallback = Ok(output);
        self
    }

    /// Every unscripted call fails with `message`
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.fallback = Err(message.into());
        self
    }

    /// The first `times` calls fail with `message`
    pub fn failing_first(self, times: usize, message: impl Into<String>) -> Self {
        let message = message.into();
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend((0..times).map(|_| Err(message.clone())));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Reject every input during validation
    pub fn rejecting_input(mut self) -> Self {
        self.reject_input = true;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of times `process` was entered
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Whether any call's cancellation token has fired
    pub fn was_cancelled(&self) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(CancellationToken::is_cancelled)
    }
}

#[async_trait]
impl AgentWorker for ScriptedWorker {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    fn model_name(&self) -> Option<String> {
        self.model.clone()
    }

    fn validate_input(&self, _input: &Value) -> Result<(), AgentError> {
        if self.reject_input {
            return Err(AgentError::validation("input flagged invalid"));
        }
        Ok(())
    }

    async fn process(
        &self,
        _input: &Value,
        _context: &AgentContext,
        cancel: CancellationToken,
    ) -> Result<ProcessOutput, AgentError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cancel.clone());

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let next = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        next.map_err(AgentError::execution_failed)
    }

    async fn health_check(&self) -> Result<(), AgentError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AgentError::execution_failed("scripted provider unavailable"))
        }
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Observer that keeps every event it is sent
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<AgentEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Event kinds in arrival order: "started", "succeeded" or "failed"
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events()
            .iter()
            .map(|event| match event.kind {
                AgentEventKind::Started { .. } => "started",
                AgentEventKind::Succeeded { .. } => "succeeded",
                AgentEventKind::Failed { .. } => "failed",
            })
            .collect()
    }
}

impl ExecutionObserver for RecordingObserver {
    fn notify(&self, event: &AgentEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
