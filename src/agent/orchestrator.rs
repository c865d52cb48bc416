//! Registry of agents keyed by agent type
//!
//! The single entry point the pipeline uses to reach agents. Only a missing
//! agent type is raised as an error; whatever happens inside an agent comes
//! back as an [`AgentResult`].

use crate::agent::events::ExecutionObserver;
use crate::agent::executor::Agent;
use crate::agent::factory::AgentFactory;
use crate::agent::task::{AgentContext, AgentResult, AgentTask};
use crate::config::AgentConfiguration;
use crate::error::AgentError;
use crate::health::HealthReport;
use crate::pipeline::retry::RetryPolicy;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Failure kinds a second attempt cannot fix
const NON_RETRYABLE_KINDS: &[&str] = &["validation", "configuration"];

pub struct AgentOrchestrator {
    agents: RwLock<HashMap<String, Arc<Agent>>>,
    /// Delay schedule between agent-level retries; its attempt count is unused
    retry_backoff: RetryPolicy,
}

impl Default for AgentOrchestrator {
    fn default() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            retry_backoff: RetryPolicy::exponential(1, 50, 1_000),
        }
    }
}

impl AgentOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Create and register one agent per `(type, configuration)` pair
    pub fn from_factory<I>(factory: &AgentFactory, agents: I) -> Result<Self, AgentError>
    where
        I: IntoIterator<Item = (String, AgentConfiguration)>,
    {
        let orchestrator = Self::new();
        for (agent_type, config) in agents {
            let agent = factory.create_agent(&agent_type, config)?;
            orchestrator.register_agent_type(agent_type, agent);
        }
        Ok(orchestrator)
    }

    /// Bind `agent` to `agent_type`; an existing binding is replaced and returned
    pub fn register_agent_type(
        &self,
        agent_type: impl Into<String>,
        agent: Arc<Agent>,
    ) -> Option<Arc<Agent>> {
        let agent_type = agent_type.into();
        let agent_id = agent.id();
        let previous = self
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_type.clone(), agent);

        match &previous {
            Some(old) => warn!(
                agent_type = %agent_type,
                replaced_agent_id = %old.id(),
                agent_id = %agent_id,
                "Agent type re-registered, previous agent replaced"
            ),
            None => info!(agent_type = %agent_type, agent_id = %agent_id, "Registered agent type"),
        }
        previous
    }

    pub fn get_agent(&self, agent_type: &str) -> Option<Arc<Agent>> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_type)
            .cloned()
    }

    /// Registered agent types, sorted
    pub fn available_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Agents whose `can_handle` accepts `task`, highest priority first
    pub fn capable_agents(&self, task: &AgentTask) -> Vec<Arc<Agent>> {
        let mut capable: Vec<Arc<Agent>> = self
            .all_agents()
            .into_iter()
            .filter(|agent| agent.can_handle(task))
            .collect();
        capable.sort_by(|a, b| {
            b.configuration()
                .priority
                .cmp(&a.configuration().priority)
                .then_with(|| a.agent_type().cmp(b.agent_type()))
        });
        capable
    }

    /// Run `task` on the agent registered for `agent_type`
    ///
    /// A task without its own retry budget inherits the agent's
    /// `retry_attempts`; `Some(0)` disables retries. Failed calls are re-run
    /// after the backoff delay until the budget is spent, and the last result
    /// is returned either way.
    pub async fn execute_agent(
        &self,
        agent_type: &str,
        mut task: AgentTask,
        context: &AgentContext,
    ) -> Result<AgentResult, AgentError> {
        let agent = self
            .get_agent(agent_type)
            .ok_or_else(|| AgentError::not_found(agent_type))?;

        task.max_retries.get_or_insert(agent.configuration().retry_attempts);

        loop {
            let result = agent.execute(&task, context).await;
            let retryable = !result
                .error_kind()
                .is_some_and(|kind| NON_RETRYABLE_KINDS.contains(&kind));

            if result.is_success() || !retryable || !task.can_retry() {
                return Ok(result);
            }

            let attempt = task.record_retry()?;
            let delay = self.retry_backoff.delay_for(attempt);
            debug!(
                agent_type,
                task_id = %task.id,
                attempt,
                max_retries = task.retry_budget(),
                delay_ms = delay.as_millis() as u64,
                reason = %result.reasoning,
                "Retrying failed agent call"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Attach `observer` to every registered agent
    pub fn add_observer(&self, observer: Arc<dyn ExecutionObserver>) {
        for agent in self.all_agents() {
            agent.add_observer(observer.clone());
        }
    }

    /// Health of every registered agent, checked concurrently
    pub async fn health_report(&self) -> HealthReport {
        let agents = self.registered();
        let statuses = join_all(agents.iter().map(|(_, agent)| agent.health_status())).await;

        HealthReport::from_statuses(
            agents
                .into_iter()
                .map(|(agent_type, _)| agent_type)
                .zip(statuses)
                .collect::<BTreeMap<_, _>>(),
        )
    }

    /// Shut every agent down
    pub async fn shutdown(&self) {
        join_all(self.all_agents().iter().map(|agent| agent.shutdown())).await;
        info!("All agents shut down");
    }

    fn registered(&self) -> Vec<(String, Arc<Agent>)> {
        self.agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(agent_type, agent)| (agent_type.clone(), agent.clone()))
            .collect()
    }

    fn all_agents(&self) -> Vec<Arc<Agent>> {
        self.registered().into_iter().map(|(_, agent)| agent).collect()
    }
}
