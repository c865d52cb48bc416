//! Agent construction by type name
//!
//! The factory maps an agent type to a constructor producing its worker, so
//! the orchestrator can be populated from configuration at startup.

use crate::agent::executor::Agent;
use crate::agent::llm_worker::LlmWorker;
use crate::agent::worker::AgentWorker;
use crate::config::{AgentConfiguration, AppConfig};
use crate::error::AgentError;
use crate::llm::provider::LlmProvider;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Builds the worker for one agent type from its configuration
pub type WorkerConstructor =
    Arc<dyn Fn(&AgentConfiguration) -> Result<Arc<dyn AgentWorker>, AgentError> + Send + Sync>;

#[derive(Default)]
pub struct AgentFactory {
    constructors: RwLock<HashMap<String, WorkerConstructor>>,
}

impl AgentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// One LLM-backed worker per `[agents.<type>]` table, all sharing `provider`
    pub fn from_config(config: &AppConfig, provider: Arc<dyn LlmProvider>) -> Self {
        let factory = Self::new();
        for (agent_type, section) in &config.agents {
            let section = section.clone();
            let provider = provider.clone();
            let default_model = config.llm.default_model.clone();
            let worker_type = agent_type.clone();
            factory.register_agent_type(
                agent_type,
                Arc::new(
                    move |_: &AgentConfiguration| -> Result<Arc<dyn AgentWorker>, AgentError> {
                        Ok(Arc::new(LlmWorker::from_section(
                            worker_type.clone(),
                            &section,
                            provider.clone(),
                            &default_model,
                        )))
                    },
                ),
            );
        }
        factory
    }

    /// Bind `constructor` to `agent_type`, replacing any previous binding
    pub fn register_agent_type(
        &self,
        agent_type: impl Into<String>,
        constructor: WorkerConstructor,
    ) {
        let agent_type = agent_type.into();
        let replaced = self
            .constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_type.clone(), constructor)
            .is_some();
        debug!(agent_type = %agent_type, replaced, "Agent constructor registered");
    }

    /// Construct and initialize an agent of `agent_type`
    pub fn create_agent(
        &self,
        agent_type: &str,
        config: AgentConfiguration,
    ) -> Result<Arc<Agent>, AgentError> {
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_type)
            .cloned()
            .ok_or_else(|| AgentError::not_found(agent_type))?;

        let worker = constructor(&config)?;
        let agent = Agent::initialize(worker, config)?;
        info!(agent_type, agent_id = %agent.id(), "Agent created");
        Ok(Arc::new(agent))
    }

    /// Registered agent types, sorted
    pub fn available_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockLlmProvider, ScriptedWorker};

    fn scripted(agent_type: &'static str) -> WorkerConstructor {
        Arc::new(
            move |_: &AgentConfiguration| -> Result<Arc<dyn AgentWorker>, AgentError> {
                Ok(Arc::new(ScriptedWorker::new(agent_type)))
            },
        )
    }

    #[test]
    fn test_create_registered_agent() {
        let factory = AgentFactory::new();
        factory.register_agent_type("classifier", scripted("classifier"));

        let agent = factory
            .create_agent("classifier", AgentConfiguration::new("c-1"))
            .unwrap();
        assert_eq!(agent.agent_type(), "classifier");
        assert_eq!(agent.id(), "c-1");
    }

    #[test]
    fn test_unknown_type_is_not_found() {
        let factory = AgentFactory::new();
        let error = factory
            .create_agent("router", AgentConfiguration::new("r-1"))
            .unwrap_err();
        assert!(matches!(error, AgentError::NotFound { .. }));
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let factory = AgentFactory::new();
        factory.register_agent_type("classifier", scripted("classifier"));
        let error = factory
            .create_agent("classifier", AgentConfiguration::new("c-1").with_timeout_ms(0))
            .unwrap_err();
        assert!(matches!(error, AgentError::Configuration { .. }));
    }

    #[test]
    fn test_from_config_registers_every_section() {
        let config = AppConfig::test_config();
        let factory = AgentFactory::from_config(&config, Arc::new(MockLlmProvider::new(vec![])));

        assert_eq!(factory.available_types(), vec!["classifier".to_string()]);
        let section = &config.agents["classifier"];
        let agent = factory
            .create_agent("classifier", section.configuration.clone())
            .unwrap();
        assert_eq!(agent.id(), "classifier-1");
    }
}
