//! Per-run working context passed from stage to stage

use crate::agent::task::AgentResult;
use crate::email::Email;
use crate::pipeline::types::PipelineConfiguration;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub email: Arc<Email>,
    pub execution_id: Uuid,
    pub pipeline_id: String,
    pub current_stage: Option<String>,
    /// Results of completed stages keyed `<stageId>:<agentType>`; only grows
    pub previous_results: BTreeMap<String, AgentResult>,
    pub configuration: Arc<PipelineConfiguration>,
}

impl PipelineContext {
    pub fn new(
        email: Arc<Email>,
        execution_id: Uuid,
        configuration: Arc<PipelineConfiguration>,
    ) -> Self {
        Self {
            email,
            execution_id,
            pipeline_id: configuration.id.clone(),
            current_stage: configuration.stages.first().map(|stage| stage.id.clone()),
            previous_results: BTreeMap::new(),
            configuration,
        }
    }

    pub fn result(&self, key: &str) -> Option<&AgentResult> {
        self.previous_results.get(key)
    }

    /// Expose a finished stage's results, keyed by agent type, to later stages
    ///
    /// Keys already present are left alone, so an earlier stage's result can
    /// never be replaced.
    pub fn merge_stage_results(&mut self, stage_id: &str, results: BTreeMap<String, AgentResult>) {
        for (agent_type, result) in results {
            self.previous_results
                .entry(format!("{stage_id}:{agent_type}"))
                .or_insert(result);
        }
    }
}
