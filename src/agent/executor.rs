//! The agent execution contract
//!
//! [`Agent`] wraps an [`AgentWorker`] with everything that is the same for
//! every agent: input validation, start/outcome notifications, the per-call
//! timeout, the concurrency limit, and conversion of every local failure into
//! a failed [`AgentResult`]. Nothing an agent does escapes as an error.

use crate::agent::events::{AgentEvent, AgentEventKind, ExecutionObserver};
use crate::agent::task::{AgentContext, AgentResult, AgentStatus, AgentTask, ProcessOutput};
use crate::agent::worker::AgentWorker;
use crate::config::{AgentConfiguration, AgentConfigurationPatch};
use crate::error::{sanitize_error_message, AgentError};
use crate::health::AgentHealthStatus;
use crate::observability::metrics::metrics;
use chrono::Utc;
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

pub struct Agent {
    agent_type: String,
    worker: Arc<dyn AgentWorker>,
    config: RwLock<AgentConfiguration>,
    observers: RwLock<Vec<Arc<dyn ExecutionObserver>>>,
    slots: Arc<Semaphore>,
    shut_down: AtomicBool,
    last_health: RwLock<Option<AgentHealthStatus>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("agent_type", &self.agent_type)
            .field("id", &self.id())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Agent {
    /// Bind a worker to a validated configuration
    pub fn initialize(
        worker: Arc<dyn AgentWorker>,
        config: AgentConfiguration,
    ) -> Result<Self, AgentError> {
        config
            .validate()
            .map_err(|e| AgentError::configuration(e.to_string()))?;

        let agent_type = worker.agent_type().to_string();
        info!(
            agent_id = %config.id,
            agent_type = %agent_type,
            timeout_ms = config.timeout_ms,
            max_concurrent_tasks = config.max_concurrent_tasks,
            "Agent initialized"
        );

        Ok(Self {
            agent_type,
            worker,
            slots: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config: RwLock::new(config),
            observers: RwLock::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            last_health: RwLock::new(None),
        })
    }

    pub fn id(&self) -> String {
        self.read_config().id.clone()
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    /// Copy of the current configuration
    pub fn configuration(&self) -> AgentConfiguration {
        self.read_config().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Calls that could start right now without waiting for a slot
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn can_handle(&self, task: &AgentTask) -> bool {
        self.worker.can_handle(task)
    }

    pub fn validate_input(&self, input: &Value) -> Result<(), AgentError> {
        self.worker.validate_input(input)
    }

    pub fn add_observer(&self, observer: Arc<dyn ExecutionObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Run one task; every outcome, including timeouts, comes back as a result
    pub async fn execute(&self, task: &AgentTask, context: &AgentContext) -> AgentResult {
        let span = crate::agent_span!(
            agent_type = %self.agent_type,
            task_id = %task.id,
            execution_id = %context.execution_id,
            stage_id = %context.stage_id
        );
        self.execute_task(task, context).instrument(span).await
    }

    async fn execute_task(&self, task: &AgentTask, context: &AgentContext) -> AgentResult {
        let started = Instant::now();
        let config = self.configuration();

        if self.is_shut_down() {
            return self.failure_result(
                &config,
                task,
                format!("Agent {} has been shut down", config.id),
                &AgentError::configuration("agent has been shut down"),
                elapsed_ms(started),
            );
        }

        if let Err(e) = self.worker.validate_input(&task.input) {
            debug!(error = %e, "Task input rejected");
            return self.failure_result(&config, task, e.detail(), &e, elapsed_ms(started));
        }

        let _slot = match self.slots.clone().acquire_owned().await {
            Ok(slot) => slot,
            Err(_) => {
                return self.failure_result(
                    &config,
                    task,
                    format!("Agent {} has been shut down", config.id),
                    &AgentError::configuration("agent has been shut down"),
                    elapsed_ms(started),
                );
            }
        };

        self.notify(context, task, AgentEventKind::Started {
            input: task.input.clone(),
        });

        let timeout = task
            .timeout
            .unwrap_or_else(|| Duration::from_millis(config.timeout_ms));
        let outcome = self.run_with_timeout(task, context, timeout).await;
        let processing_time_ms = elapsed_ms(started);

        match outcome {
            Ok(output) => {
                let result = self.success_result(&config, task, output, processing_time_ms);
                debug!(
                    confidence = result.confidence,
                    status = ?result.status,
                    processing_time_ms,
                    "Agent call finished"
                );
                self.notify(context, task, AgentEventKind::Succeeded {
                    confidence: result.confidence,
                    processing_time_ms,
                });
                result
            }
            Err(e) => {
                let reasoning = match &e {
                    AgentError::Timeout { .. } => sanitize_error_message(&e.to_string()),
                    other => format!("Execution failed: {}", other.detail()),
                };
                warn!(error = %e, processing_time_ms, "Agent call failed");
                let result = self.failure_result(&config, task, reasoning, &e, processing_time_ms);
                self.notify(context, task, AgentEventKind::Failed {
                    error: result.reasoning.clone(),
                    processing_time_ms,
                });
                result
            }
        }
    }

    /// Race `process` against `timeout`; on expiry the future is dropped and
    /// the token cancelled so provider work is released
    async fn run_with_timeout(
        &self,
        task: &AgentTask,
        context: &AgentContext,
        timeout: Duration,
    ) -> Result<ProcessOutput, AgentError> {
        let cancel = CancellationToken::new();
        let call = self.worker.process(&task.input, context, cancel.clone());

        match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                metrics().agent_call_timed_out();
                Err(AgentError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn success_result(
        &self,
        config: &AgentConfiguration,
        task: &AgentTask,
        output: ProcessOutput,
        processing_time_ms: u64,
    ) -> AgentResult {
        let confidence = if output.confidence.is_finite() {
            output.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let status = match config.review_threshold {
            Some(threshold) if confidence < threshold => AgentStatus::NeedsReview,
            _ => AgentStatus::Success,
        };

        let mut metadata = output.metadata;
        metadata.insert("model_used".to_string(), self.model_used(config));
        metadata.insert("retry_count".to_string(), json!(task.current_retries));

        AgentResult {
            agent_id: config.id.clone(),
            agent_type: self.agent_type.clone(),
            status,
            confidence,
            data: output.data,
            reasoning: output.reasoning,
            processing_time_ms,
            timestamp: Utc::now(),
            metadata,
        }
    }

    fn failure_result(
        &self,
        config: &AgentConfiguration,
        task: &AgentTask,
        reasoning: String,
        error: &AgentError,
        processing_time_ms: u64,
    ) -> AgentResult {
        AgentResult::failure(&config.id, &self.agent_type, reasoning, processing_time_ms)
            .with_metadata("error", json!(error.detail()))
            .with_metadata("error_kind", json!(error.kind()))
            .with_metadata("model_used", self.model_used(config))
            .with_metadata("retry_count", json!(task.current_retries))
    }

    fn model_used(&self, config: &AgentConfiguration) -> Value {
        self.worker
            .model_name()
            .or_else(|| config.model.clone())
            .map(Value::String)
            .unwrap_or(Value::Null)
    }

    fn notify(&self, context: &AgentContext, task: &AgentTask, kind: AgentEventKind) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if observers.is_empty() {
            return;
        }

        let event = AgentEvent {
            execution_id: context.execution_id,
            task_id: task.id,
            agent_id: self.id(),
            agent_type: self.agent_type.clone(),
            timestamp: Utc::now(),
            kind,
        };
        for observer in observers {
            // A panicking observer must not take the call down with it
            if catch_unwind(AssertUnwindSafe(|| observer.notify(&event))).is_err() {
                warn!(agent_type = %self.agent_type, "Execution observer panicked");
            }
        }
    }

    /// Probe the worker's provider; never fails
    pub async fn health_status(&self) -> AgentHealthStatus {
        let config = self.configuration();
        let started = Instant::now();

        let status = if self.is_shut_down() {
            AgentHealthStatus::unhealthy(
                &config.id,
                &self.agent_type,
                "agent has been shut down",
                0,
            )
        } else {
            let probe = self.worker.health_check();
            match tokio::time::timeout(Duration::from_millis(config.timeout_ms), probe).await {
                Ok(Ok(())) => {
                    AgentHealthStatus::healthy(&config.id, &self.agent_type, elapsed_ms(started))
                }
                Ok(Err(e)) => AgentHealthStatus::unhealthy(
                    &config.id,
                    &self.agent_type,
                    e.detail(),
                    elapsed_ms(started),
                ),
                Err(_) => AgentHealthStatus::unhealthy(
                    &config.id,
                    &self.agent_type,
                    format!("health check timeout after {}ms", config.timeout_ms),
                    elapsed_ms(started),
                ),
            }
        };

        if !status.healthy {
            warn!(agent_type = %self.agent_type, issues = ?status.issues, "Agent unhealthy");
        }
        *self
            .last_health
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(status.clone());
        status
    }

    pub fn last_health_status(&self) -> Option<AgentHealthStatus> {
        self.last_health
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Merge `patch` into the current configuration
    ///
    /// The merged configuration is validated before it replaces the current
    /// one; on error nothing changes. Calls already running keep the settings
    /// they started with.
    pub fn update_configuration(
        &self,
        patch: &AgentConfigurationPatch,
    ) -> Result<AgentConfiguration, AgentError> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let merged = patch.apply_to(&config);
        merged
            .validate()
            .map_err(|e| AgentError::configuration(e.to_string()))?;

        self.resize_slots(config.max_concurrent_tasks, merged.max_concurrent_tasks);
        *config = merged.clone();

        info!(agent_id = %merged.id, agent_type = %self.agent_type, "Agent configuration updated");
        Ok(merged)
    }

    fn resize_slots(&self, current: usize, wanted: usize) {
        if wanted > current {
            self.slots.add_permits(wanted - current);
        } else if wanted < current {
            let excess = (current - wanted) as u32;
            // Best effort: slots held by running calls are not reclaimed
            match self.slots.try_acquire_many(excess) {
                Ok(permits) => permits.forget(),
                Err(_) => debug!(
                    agent_type = %self.agent_type,
                    "Concurrency limit lowered while calls are in flight"
                ),
            }
        }
    }

    /// Release worker resources; later calls fail immediately
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slots.close();
        self.worker.shutdown().await;
        info!(agent_type = %self.agent_type, "Agent shut down");
    }

    fn read_config(&self) -> std::sync::RwLockReadGuard<'_, AgentConfiguration> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
