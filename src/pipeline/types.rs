//! Static pipeline definition: stages, conditions and failure policy

use crate::agent::task::AgentResult;
use crate::error::PipelineError;
use crate::pipeline::aggregation::AggregationPolicy;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// How the pipeline reacts when a required stage fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStrategy {
    /// Abort the run and return the stage's error
    #[default]
    Stop,
    /// Record the failure and carry on with the next stage
    Continue,
    /// Re-run stages marked `retry_on_failure`, then abort
    Retry,
}

/// Programmatic stage condition
pub type ConditionFn = Arc<dyn Fn(&PipelineContext) -> bool + Send + Sync>;

/// Decides whether a stage runs, evaluated against results of earlier stages
///
/// `result` names an earlier result by its `<stageId>:<agentType>` key. A
/// declarative condition whose result is absent evaluates to false.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageCondition {
    /// The named result exists and did not fail
    ResultSucceeded { result: String },
    /// The named result's confidence is below `threshold`
    ConfidenceBelow { result: String, threshold: f64 },
    /// The named result's confidence is at least `threshold`
    ConfidenceAtLeast { result: String, threshold: f64 },
    /// `data[field]` of the named result equals `value`
    FieldEquals {
        result: String,
        field: String,
        value: Value,
    },
    #[serde(skip)]
    Predicate(ConditionFn),
}

impl StageCondition {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&PipelineContext) -> bool + Send + Sync + 'static,
    {
        StageCondition::Predicate(Arc::new(f))
    }

    pub fn evaluate(&self, context: &PipelineContext) -> bool {
        let lookup = |key: &str| context.result(key);

        match self {
            StageCondition::ResultSucceeded { result } => {
                lookup(result).is_some_and(AgentResult::is_success)
            }
            StageCondition::ConfidenceBelow { result, threshold } => {
                lookup(result).is_some_and(|r| r.confidence < *threshold)
            }
            StageCondition::ConfidenceAtLeast { result, threshold } => {
                lookup(result).is_some_and(|r| r.is_success() && r.confidence >= *threshold)
            }
            StageCondition::FieldEquals {
                result,
                field,
                value,
            } => lookup(result).is_some_and(|r| r.data.get(field) == Some(value)),
            StageCondition::Predicate(f) => f(context),
        }
    }
}

impl fmt::Debug for StageCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageCondition::ResultSucceeded { result } => f
                .debug_struct("ResultSucceeded")
                .field("result", result)
                .finish(),
            StageCondition::ConfidenceBelow { result, threshold } => f
                .debug_struct("ConfidenceBelow")
                .field("result", result)
                .field("threshold", threshold)
                .finish(),
            StageCondition::ConfidenceAtLeast { result, threshold } => f
                .debug_struct("ConfidenceAtLeast")
                .field("result", result)
                .field("threshold", threshold)
                .finish(),
            StageCondition::FieldEquals {
                result,
                field,
                value,
            } => f
                .debug_struct("FieldEquals")
                .field("result", result)
                .field("field", field)
                .field("value", value)
                .finish(),
            StageCondition::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// One pipeline step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    /// Agent types dispatched by this stage, in order
    pub agent_types: Vec<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub retry_on_failure: bool,
    /// Per-agent timeout for this stage, overriding agent configuration
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub condition: Option<StageCondition>,
}

fn default_required() -> bool {
    true
}

impl Stage {
    /// Required, sequential stage without retries or condition
    pub fn new<I, S>(id: impl Into<String>, agent_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            agent_types: agent_types.into_iter().map(Into::into).collect(),
            parallel: false,
            required: true,
            retry_on_failure: false,
            timeout_ms: None,
            condition: None,
        }
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn retry_on_failure(mut self) -> Self {
        self.retry_on_failure = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_condition(mut self, condition: StageCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Key under which an agent's result in this stage is exposed
    pub fn result_key(&self, agent_type: &str) -> String {
        format!("{}:{}", self.id, agent_type)
    }
}

/// Static pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfiguration {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub aggregation: AggregationPolicy,
    /// Stage weights for weighted aggregation; missing stages weigh 1.0
    #[serde(default)]
    pub stage_weights: HashMap<String, f64>,
}

impl PipelineConfiguration {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stages: Vec::new(),
            failure_strategy: FailureStrategy::default(),
            retry: RetryPolicy::default(),
            aggregation: AggregationPolicy::default(),
            stage_weights: HashMap::new(),
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = strategy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.id == id)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.id.trim().is_empty() {
            return Err(invalid("pipeline id must not be empty"));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.id.trim().is_empty() {
                return Err(invalid("stage id must not be empty"));
            }
            if stage.id.contains(':') {
                return Err(invalid(format!(
                    "stage id '{}' must not contain ':'",
                    stage.id
                )));
            }
            if !seen.insert(stage.id.as_str()) {
                return Err(invalid(format!("duplicate stage id '{}'", stage.id)));
            }
            if stage.agent_types.is_empty() {
                return Err(invalid(format!("stage '{}' has no agent types", stage.id)));
            }
            let mut types = HashSet::new();
            if let Some(dup) = stage.agent_types.iter().find(|t| !types.insert(t.as_str())) {
                return Err(invalid(format!(
                    "stage '{}' lists agent type '{dup}' twice",
                    stage.id
                )));
            }
            if stage.timeout_ms == Some(0) {
                return Err(invalid(format!(
                    "stage '{}': timeout_ms must be greater than 0",
                    stage.id
                )));
            }
        }

        self.retry.validate()?;

        if let Some((stage, weight)) = self
            .stage_weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(invalid(format!(
                "stage weight for '{stage}' must be a non-negative number, got {weight}"
            )));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::ConfigurationError(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::task::AgentStatus;
    use crate::email::Email;
    use serde_json::json;
    use uuid::Uuid;

    fn context_with(key: &str, confidence: f64, data: Value) -> PipelineContext {
        let config = Arc::new(PipelineConfiguration::new("p", "p"));
        let email = Arc::new(Email::new("m", "a@b.c", "s", "b"));
        let mut context = PipelineContext::new(email, Uuid::new_v4(), config);
        let mut result = AgentResult::failure("c-1", "classifier", "", 1);
        result.status = AgentStatus::Success;
        result.confidence = confidence;
        result.data = data;
        let (stage, agent) = key.split_once(':').unwrap();
        context.merge_stage_results(stage, [(agent.to_string(), result)].into_iter().collect());
        context
    }

    #[test]
    fn test_declarative_conditions() {
        let context = context_with("triage:classifier", 0.4, json!({"category": "spam"}));

        assert!(StageCondition::ResultSucceeded {
            result: "triage:classifier".into()
        }
        .evaluate(&context));
        assert!(StageCondition::ConfidenceBelow {
            result: "triage:classifier".into(),
            threshold: 0.5
        }
        .evaluate(&context));
        assert!(!StageCondition::ConfidenceAtLeast {
            result: "triage:classifier".into(),
            threshold: 0.5
        }
        .evaluate(&context));
        assert!(StageCondition::FieldEquals {
            result: "triage:classifier".into(),
            field: "category".into(),
            value: json!("spam"),
        }
        .evaluate(&context));
    }

    #[test]
    fn test_missing_result_is_false() {
        let context = context_with("triage:classifier", 0.9, json!({}));
        let condition = StageCondition::ConfidenceBelow {
            result: "routing:router".into(),
            threshold: 1.0,
        };
        assert!(!condition.evaluate(&context));
    }

    #[test]
    fn test_predicate_condition() {
        let context = context_with("triage:classifier", 0.9, json!({}));
        let condition = StageCondition::predicate(|ctx| ctx.previous_results.len() == 1);
        assert!(condition.evaluate(&context));
        assert_eq!(format!("{condition:?}"), "Predicate(..)");
    }

    #[test]
    fn test_condition_deserializes_from_toml() {
        let stage: Stage = toml::from_str(
            r#"
id = "routing"
agent_types = ["router"]
condition = { kind = "field_equals", result = "triage:classifier", field = "category", value = "billing" }
"#,
        )
        .unwrap();
        assert!(stage.required);
        assert!(matches!(
            stage.condition,
            Some(StageCondition::FieldEquals { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_stage_ids() {
        let config = PipelineConfiguration::new("p", "p")
            .with_stage(Stage::new("triage", ["classifier"]))
            .with_stage(Stage::new("triage", ["router"]));
        assert!(matches!(
            config.validate(),
            Err(PipelineError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_agent_types() {
        let config = PipelineConfiguration::new("p", "p")
            .with_stage(Stage::new("triage", Vec::<String>::new()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_repeated_agent_type_and_colon_ids() {
        let repeated = PipelineConfiguration::new("p", "p")
            .with_stage(Stage::new("triage", ["classifier", "classifier"]));
        assert!(repeated.validate().is_err());

        let colon = PipelineConfiguration::new("p", "p").with_stage(Stage::new("a:b", ["x"]));
        assert!(colon.validate().is_err());
    }

    #[test]
    fn test_valid_configuration() {
        let config = PipelineConfiguration::new("p", "p")
            .with_stage(Stage::new("triage", ["classifier", "urgency"]).parallel())
            .with_stage(Stage::new("routing", ["router"]).optional());
        assert!(config.validate().is_ok());
        assert_eq!(config.stage("triage").unwrap().result_key("urgency"), "triage:urgency");
    }
}
