//! Pipeline execution engine
//!
//! Runs an email through the configured stages in declared order. Each run
//! owns one [`PipelineExecution`] in the shared [`ExecutionTable`]; callers
//! can inspect, pause, resume or cancel it by id while it runs. Pause and
//! cancel are cooperative: they are observed between stages, never inside an
//! agent call, so the stage in flight always finishes first.

use crate::agent::orchestrator::AgentOrchestrator;
use crate::agent::task::{AgentContext, AgentResult, AgentTask};
use crate::config::AppConfig;
use crate::email::Email;
use crate::error::{AgentError, PipelineError};
use crate::observability::metrics::metrics;
use crate::pipeline::aggregation::{ProcessingResult, ResultAggregator};
use crate::pipeline::context::PipelineContext;
use crate::pipeline::execution::{
    ExecutionError, ExecutionStatus, ExecutionTable, PipelineExecution,
};
use crate::pipeline::types::{FailureStrategy, PipelineConfiguration, Stage};
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const DEFAULT_MAX_RETAINED_EXECUTIONS: usize = 1000;

pub struct Pipeline {
    config: Arc<PipelineConfiguration>,
    orchestrator: Arc<AgentOrchestrator>,
    aggregator: Arc<dyn ResultAggregator>,
    executions: ExecutionTable,
    history_limit: usize,
}

/// Everything one attempt of a stage produced
#[derive(Debug, Default)]
struct StageReport {
    /// Keyed by agent type
    results: BTreeMap<String, AgentResult>,
    failed_agents: Vec<String>,
    /// First orchestration-level error, e.g. an unregistered agent type
    orchestration_error: Option<AgentError>,
}

impl StageReport {
    fn succeeded(&self) -> bool {
        self.failed_agents.is_empty()
    }

    /// Store one agent's outcome; returns whether it succeeded
    fn record(&mut self, agent_type: &str, outcome: Result<AgentResult, AgentError>) -> bool {
        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                let detail = error.detail();
                let result = AgentResult::failure(
                    "unregistered",
                    agent_type,
                    format!("Orchestration failed: {detail}"),
                    0,
                )
                .with_metadata("error", json!(detail))
                .with_metadata("error_kind", json!(error.kind()));
                self.orchestration_error.get_or_insert(error);
                result
            }
        };

        let succeeded = result.is_success();
        if !succeeded {
            self.failed_agents.push(agent_type.to_string());
        }
        self.results.insert(agent_type.to_string(), result);
        succeeded
    }

    fn failure_reason(&self) -> String {
        self.failed_agents
            .iter()
            .filter_map(|agent_type| self.results.get(agent_type))
            .map(|result| format!("{}: {}", result.agent_type, result.reasoning))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl Pipeline {
    /// Validate `config` and bind it to `orchestrator`
    ///
    /// Agent types the orchestrator does not know yet only produce a warning;
    /// they may be registered before the first run.
    pub fn new(
        config: PipelineConfiguration,
        orchestrator: Arc<AgentOrchestrator>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let registered = orchestrator.available_types();
        for stage in &config.stages {
            for agent_type in &stage.agent_types {
                if !registered.contains(agent_type) {
                    warn!(
                        pipeline_id = %config.id,
                        stage_id = %stage.id,
                        agent_type = %agent_type,
                        "Stage references an agent type that is not registered"
                    );
                }
            }
        }

        let aggregator = config.aggregation.build(&config.stage_weights);
        info!(
            pipeline_id = %config.id,
            stages = config.stages.len(),
            failure_strategy = ?config.failure_strategy,
            aggregation = aggregator.name(),
            "Pipeline configured"
        );

        Ok(Self {
            config: Arc::new(config),
            orchestrator,
            aggregator,
            executions: ExecutionTable::new(DEFAULT_MAX_RETAINED_EXECUTIONS),
            history_limit: DEFAULT_HISTORY_LIMIT,
        })
    }

    /// Pipeline, retention and history settings from the application config
    pub fn from_config(
        config: &AppConfig,
        orchestrator: Arc<AgentOrchestrator>,
    ) -> Result<Self, PipelineError> {
        Ok(Self::new(config.pipeline.clone(), orchestrator)?
            .with_retention(config.execution.max_retained_executions)
            .with_history_limit(config.execution.history_limit))
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn ResultAggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Keep at most `max_retained` finished executions
    pub fn with_retention(mut self, max_retained: usize) -> Self {
        self.executions = ExecutionTable::new(max_retained);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn configuration(&self) -> &PipelineConfiguration {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<AgentOrchestrator> {
        &self.orchestrator
    }

    /// Run `email` through every stage and wait for the outcome
    pub async fn execute(&self, email: Email) -> Result<ProcessingResult, PipelineError> {
        let id = self.begin(&email);
        self.run(id, Arc::new(email)).await
    }

    /// Start a run on its own task
    ///
    /// The execution is registered before this returns, so the id can be
    /// used with the control operations right away.
    pub fn spawn(
        self: &Arc<Self>,
        email: Email,
    ) -> (Uuid, JoinHandle<Result<ProcessingResult, PipelineError>>) {
        let id = self.begin(&email);
        let pipeline = Arc::clone(self);
        let handle = tokio::spawn(async move { pipeline.run(id, Arc::new(email)).await });
        (id, handle)
    }

    pub fn get_execution_status(&self, id: Uuid) -> Option<PipelineExecution> {
        self.executions.get(id)
    }

    /// Cancel a running execution; takes effect at the next stage boundary
    pub fn cancel_execution(&self, id: Uuid) -> bool {
        self.control(id, ExecutionStatus::Running, ExecutionStatus::Cancelled)
    }

    /// Hold a running execution before its next stage
    pub fn pause_execution(&self, id: Uuid) -> bool {
        self.control(id, ExecutionStatus::Running, ExecutionStatus::Paused)
    }

    pub fn resume_execution(&self, id: Uuid) -> bool {
        self.control(id, ExecutionStatus::Paused, ExecutionStatus::Running)
    }

    /// Most recent runs first; `None` uses the configured history limit
    pub fn get_execution_history(&self, limit: Option<usize>) -> Vec<PipelineExecution> {
        self.executions.history(limit.unwrap_or(self.history_limit))
    }

    fn control(&self, id: Uuid, from: ExecutionStatus, to: ExecutionStatus) -> bool {
        let changed = self.executions.transition_if(id, from, to);
        if changed {
            info!(execution_id = %id, from = %from, to = %to, "Execution status changed");
        } else {
            debug!(
                execution_id = %id,
                requested = %to,
                current = ?self.executions.status(id),
                "Execution control request ignored"
            );
        }
        changed
    }

    fn begin(&self, email: &Email) -> Uuid {
        let execution = PipelineExecution::new(self.config.id.clone(), email.id.clone());
        let id = execution.id;
        self.executions.insert(execution);
        metrics().execution_started();
        debug!(execution_id = %id, email_id = %email.id, "Execution registered");
        id
    }

    async fn run(&self, id: Uuid, email: Arc<Email>) -> Result<ProcessingResult, PipelineError> {
        let span = crate::pipeline_span!(
            execution_id = %id,
            pipeline_id = %self.config.id,
            email_id = %email.id
        );
        self.run_stages(id, email).instrument(span).await
    }

    async fn run_stages(
        &self,
        id: Uuid,
        email: Arc<Email>,
    ) -> Result<ProcessingResult, PipelineError> {
        if !self
            .executions
            .transition_if(id, ExecutionStatus::Initialized, ExecutionStatus::Running)
        {
            return Err(self.interrupted(id, self.executions.status(id)));
        }
        info!("Pipeline execution started");

        let mut context = PipelineContext::new(email, id, self.config.clone());

        for stage in &self.config.stages {
            match self.executions.wait_while_paused(id).await {
                Some(ExecutionStatus::Running) => {}
                status => return Err(self.interrupted(id, status)),
            }

            context.current_stage = Some(stage.id.clone());
            self.executions
                .update(id, |execution| execution.set_current_stage(&stage.id))?;

            if let Some(condition) = &stage.condition {
                if !condition.evaluate(&context) {
                    info!(stage_id = %stage.id, "Stage condition not met, skipping");
                    self.executions
                        .update(id, |execution| execution.skip_stage(&stage.id))?;
                    metrics().stage_skipped();
                    continue;
                }
            }

            let span = crate::stage_span!(
                stage_id = %stage.id,
                parallel = stage.parallel,
                agents = stage.agent_types.len()
            );
            let report = self
                .run_stage_with_policy(id, stage, &context)
                .instrument(span)
                .await?;

            if report.succeeded() {
                metrics().stage_completed();
                let results = report.results;
                self.executions.update(id, |execution| {
                    execution.complete_stage(&stage.id, results.clone())
                })?;
                context.merge_stage_results(&stage.id, results);
                debug!(stage_id = %stage.id, "Stage completed");
                continue;
            }

            metrics().stage_failed();
            let reason = report.failure_reason();
            let recorded = ExecutionError::new(&stage.id, &reason, stage.retry_on_failure);
            let results = report.results;
            self.executions.update(id, |execution| {
                execution.fail_stage(&stage.id, results, recorded)
            })?;

            let fatal = stage.required && self.config.failure_strategy != FailureStrategy::Continue;
            if !fatal {
                warn!(
                    stage_id = %stage.id,
                    failed_agents = ?report.failed_agents,
                    reason = %reason,
                    "Stage failed, continuing"
                );
                continue;
            }

            let error = match report.orchestration_error {
                Some(error) => PipelineError::Agent(error),
                None => PipelineError::StageFailed {
                    stage_id: stage.id.clone(),
                    reason,
                    failed_agents: report.failed_agents,
                },
            };
            return Err(self.fail(id, error).await);
        }

        self.complete(id, &context).await
    }

    /// Run a stage, re-attempting it when the failure policy allows
    async fn run_stage_with_policy(
        &self,
        id: Uuid,
        stage: &Stage,
        context: &PipelineContext,
    ) -> Result<StageReport, PipelineError> {
        let retry = &self.config.retry;
        let max_attempts = if stage.required
            && stage.retry_on_failure
            && self.config.failure_strategy == FailureStrategy::Retry
        {
            retry.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 1;
        loop {
            self.executions
                .update(id, |execution| execution.record_attempt(&stage.id))?;
            let report = self.execute_stage(id, stage, context).await;

            // An unregistered agent type will not appear between attempts
            let exhausted = attempt >= max_attempts || report.orchestration_error.is_some();
            if report.succeeded() || exhausted {
                return Ok(report);
            }

            let delay = retry.delay_for(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                failed_agents = ?report.failed_agents,
                "Stage failed, retrying"
            );
            metrics().stage_retried();
            tokio::time::sleep(delay).await;

            if self.executions.status(id) == Some(ExecutionStatus::Cancelled) {
                return Ok(report);
            }
            attempt += 1;
        }
    }

    /// Dispatch every agent of `stage`
    ///
    /// Parallel stages settle every call before returning. Sequential stages
    /// stop at the first failure.
    async fn execute_stage(
        &self,
        execution_id: Uuid,
        stage: &Stage,
        context: &PipelineContext,
    ) -> StageReport {
        let agent_context =
            AgentContext::new(execution_id, stage.id.clone(), context.email.clone())
                .with_previous_results(context.previous_results.clone());
        let input = context.email.to_agent_input();
        let mut report = StageReport::default();

        if stage.parallel {
            let calls = stage.agent_types.iter().map(|agent_type| {
                let task = task_for(stage, agent_type, input.clone());
                self.orchestrator
                    .execute_agent(agent_type, task, &agent_context)
            });
            let outcomes = join_all(calls).await;
            for (agent_type, outcome) in stage.agent_types.iter().zip(outcomes) {
                report.record(agent_type, outcome);
            }
        } else {
            for agent_type in &stage.agent_types {
                let task = task_for(stage, agent_type, input.clone());
                let outcome = self
                    .orchestrator
                    .execute_agent(agent_type, task, &agent_context)
                    .await;
                if !report.record(agent_type, outcome) {
                    break;
                }
            }
        }

        report
    }

    async fn complete(
        &self,
        id: Uuid,
        context: &PipelineContext,
    ) -> Result<ProcessingResult, PipelineError> {
        let execution = self.finish(id, ExecutionStatus::Completed).await?;
        let aggregate = self
            .aggregator
            .aggregate(&execution.completed_stages, &context.previous_results);
        let processing_time_ms = execution.duration_ms();
        metrics().execution_completed(processing_time_ms);
        info!(
            completed_stages = execution.completed_stages.len(),
            failed_stages = execution.failed_stages.len(),
            skipped_stages = execution.skipped_stages.len(),
            confidence = aggregate.confidence,
            needs_review = aggregate.needs_review,
            duration_ms = processing_time_ms,
            "Pipeline execution completed"
        );

        Ok(ProcessingResult {
            execution_id: execution.id,
            pipeline_id: execution.pipeline_id,
            email_id: execution.email_id,
            confidence: aggregate.confidence,
            data: aggregate.data,
            reasoning: aggregate.reasoning,
            source: aggregate.source,
            needs_review: aggregate.needs_review,
            aggregation: self.aggregator.name().to_string(),
            completed_stages: execution.completed_stages,
            failed_stages: execution.failed_stages,
            skipped_stages: execution.skipped_stages,
            results: execution.results,
            processing_time_ms,
            completed_at: execution.end_time.unwrap_or_else(Utc::now),
        })
    }

    /// Mark the run failed and hand back the error to raise
    async fn fail(&self, id: Uuid, error: PipelineError) -> PipelineError {
        match self.finish(id, ExecutionStatus::Failed).await {
            Ok(execution) => {
                metrics().execution_failed(execution.duration_ms());
                error!(error = %error, "Pipeline execution failed");
                error
            }
            Err(interrupted) => interrupted,
        }
    }

    /// Move a running execution to a terminal status and return the final record
    ///
    /// A pause requested while the last stage was in flight holds the run
    /// here until it is resumed.
    async fn finish(
        &self,
        id: Uuid,
        next: ExecutionStatus,
    ) -> Result<PipelineExecution, PipelineError> {
        loop {
            match self.executions.wait_while_paused(id).await {
                Some(ExecutionStatus::Running) => {}
                status => return Err(self.interrupted(id, status)),
            }

            let finished = self.executions.update(id, |execution| {
                let current = execution.status;
                match current {
                    ExecutionStatus::Running => execution
                        .transition(next)
                        .map(|()| Some(execution.clone()))
                        .map_err(|_| current),
                    // Paused again between the wait and the lock
                    ExecutionStatus::Paused => Ok(None),
                    status => Err(status),
                }
            })?;

            match finished {
                Ok(Some(execution)) => return Ok(execution),
                Ok(None) => continue,
                Err(status) => return Err(self.interrupted(id, Some(status))),
            }
        }
    }

    /// Error for a run that found its execution in an unexpected state
    fn interrupted(&self, id: Uuid, status: Option<ExecutionStatus>) -> PipelineError {
        match status {
            Some(ExecutionStatus::Cancelled) => {
                metrics().execution_cancelled();
                info!(execution_id = %id, "Pipeline execution cancelled");
                PipelineError::Cancelled(id)
            }
            Some(status) => PipelineError::InvalidTransition {
                id,
                from: status.to_string(),
                to: ExecutionStatus::Running.to_string(),
            },
            None => PipelineError::ExecutionNotFound(id),
        }
    }
}

fn task_for(stage: &Stage, agent_type: &str, input: Value) -> AgentTask {
    let mut task = AgentTask::new(agent_type, input);
    if let Some(timeout_ms) = stage.timeout_ms {
        task = task.with_timeout(Duration::from_millis(timeout_ms));
    }
    task.metadata
        .insert("stage_id".to_string(), json!(stage.id));
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::executor::Agent;
    use crate::agent::worker::AgentWorker;
    use crate::config::AgentConfiguration;
    use crate::testing::mocks::ScriptedWorker;

    fn orchestrator_with(workers: Vec<ScriptedWorker>) -> Arc<AgentOrchestrator> {
        let orchestrator = AgentOrchestrator::new();
        for worker in workers {
            let agent_type = worker.agent_type().to_string();
            let agent = Agent::initialize(
                Arc::new(worker),
                AgentConfiguration::new(format!("{agent_type}-1")),
            )
            .unwrap();
            orchestrator.register_agent_type(agent_type, Arc::new(agent));
        }
        Arc::new(orchestrator)
    }

    fn email() -> Email {
        Email::new("msg-1", "alice@example.com", "Invoice overdue", "Please pay")
    }

    #[test]
    fn test_report_tracks_failures_in_order() {
        let mut report = StageReport::default();
        assert!(report.record("classifier", Ok(AgentResult {
            status: crate::agent::task::AgentStatus::Success,
            ..AgentResult::failure("c-1", "classifier", "ok", 1)
        })));
        assert!(!report.record("router", Err(AgentError::not_found("router"))));

        assert!(!report.succeeded());
        assert_eq!(report.failed_agents, vec!["router".to_string()]);
        assert!(report.failure_reason().starts_with("router: Orchestration failed"));
        assert_eq!(report.results["router"].error_kind(), Some("not_found"));
    }

    #[test]
    fn test_stage_timeout_is_applied_to_tasks() {
        let stage = Stage::new("triage", ["classifier"]).with_timeout_ms(250);
        let task = task_for(&stage, "classifier", json!({}));
        assert_eq!(task.timeout, Some(Duration::from_millis(250)));
        assert_eq!(task.metadata["stage_id"], json!("triage"));
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let config = PipelineConfiguration::new("", "broken");
        assert!(matches!(
            Pipeline::new(config, Arc::new(AgentOrchestrator::new())),
            Err(PipelineError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_two_stage_run_completes() {
        let config = PipelineConfiguration::new("triage", "Triage")
            .with_stage(Stage::new("classify", ["classifier"]))
            .with_stage(Stage::new("route", ["router"]));
        let pipeline = Pipeline::new(
            config,
            orchestrator_with(vec![
                ScriptedWorker::new("classifier"),
                ScriptedWorker::new("router"),
            ]),
        )
        .unwrap();

        let result = pipeline.execute(email()).await.unwrap();

        assert_eq!(result.completed_stages, vec!["classify", "route"]);
        assert_eq!(result.results.len(), 2);
        assert_eq!(result.aggregation, "highest_confidence");
        let execution = pipeline.get_execution_status(result.execution_id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.end_time.is_some());
        assert!(execution.current_stage.is_none());
    }
}
