//! Configuration system
//!
//! A single TOML file describes the reasoning provider, every agent type the
//! orchestrator should register, the pipeline's stages and failure policy, and
//! execution-table retention:
//!
//! ```toml
//! [llm]
//! provider = "anthropic"
//! api_key_env = "ANTHROPIC_API_KEY"
//! default_model = "claude-3-5-haiku-20241022"
//!
//! [pipeline]
//! id = "email-triage"
//! name = "Email triage"
//! failure_strategy = "stop"
//!
//! [[pipeline.stages]]
//! id = "triage"
//! agent_types = ["classifier"]
//!
//! [agents.classifier]
//! id = "classifier-1"
//! instructions = "Classify the email."
//! ```

use crate::agent::structured::ResponseSchema;
use crate::pipeline::PipelineConfiguration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub pipeline: PipelineConfiguration,
    #[serde(default)]
    pub agents: HashMap<String, AgentSection>,
    #[serde(default)]
    pub execution: ExecutionSection,
}

/// Reasoning provider section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSection {
    /// Provider name (currently "anthropic")
    pub provider: String,
    /// Environment variable containing the API key
    pub api_key_env: String,
    /// Model used by agents that do not name one
    pub default_model: String,
    /// Override for the provider base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// HTTP timeout for provider calls
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider_timeout_secs() -> u64 {
    60
}

/// One `[agents.<type>]` table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    #[serde(flatten)]
    pub configuration: AgentConfiguration,
    /// System prompt for LLM-backed agents
    #[serde(default)]
    pub instructions: String,
    /// Expected fields of the agent's structured response
    #[serde(default)]
    pub response_schema: Option<ResponseSchema>,
}

/// Static agent setup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfiguration {
    /// Agent identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Higher runs first when several agents can handle a task
    #[serde(default)]
    pub priority: u8,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Per-call timeout in milliseconds, must be > 0
    #[serde(default = "default_agent_timeout_ms")]
    pub timeout_ms: u64,
    /// Agent-level re-executions after a failed call
    #[serde(default)]
    pub retry_attempts: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Successful results below this confidence are marked needs_review
    #[serde(default)]
    pub review_threshold: Option<f64>,
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_agent_timeout_ms() -> u64 {
    30_000
}

impl AgentConfiguration {
    /// Configuration with defaults for everything but the id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: Vec::new(),
            priority: 0,
            max_concurrent_tasks: default_max_concurrent_tasks(),
            timeout_ms: default_agent_timeout_ms(),
            retry_attempts: 0,
            dependencies: Vec::new(),
            model: None,
            temperature: None,
            max_tokens: None,
            review_threshold: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry_attempts(mut self, retry_attempts: u32) -> Self {
        self.retry_attempts = retry_attempts;
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_review_threshold(mut self, threshold: f64) -> Self {
        self.review_threshold = Some(threshold);
        self
    }

    /// Check required fields and ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_agent_id(&self.id)?;

        if self.timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "agent '{}': timeout_ms must be greater than 0",
                self.id
            )));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "agent '{}': max_concurrent_tasks must be greater than 0",
                self.id
            )));
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConfigError::InvalidConfig(format!(
                    "agent '{}': temperature {temperature} outside 0.0..=2.0",
                    self.id
                )));
            }
        }
        if let Some(threshold) = self.review_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::InvalidConfig(format!(
                    "agent '{}': review_threshold {threshold} outside 0.0..=1.0",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

/// Partial update merged into an existing [`AgentConfiguration`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConfigurationPatch {
    pub capabilities: Option<Vec<String>>,
    pub priority: Option<u8>,
    pub max_concurrent_tasks: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub dependencies: Option<Vec<String>>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub review_threshold: Option<f64>,
}

impl AgentConfigurationPatch {
    /// Produce the merged configuration; the base is left untouched
    pub fn apply_to(&self, base: &AgentConfiguration) -> AgentConfiguration {
        let mut merged = base.clone();
        if let Some(capabilities) = &self.capabilities {
            merged.capabilities = capabilities.clone();
        }
        if let Some(priority) = self.priority {
            merged.priority = priority;
        }
        if let Some(max) = self.max_concurrent_tasks {
            merged.max_concurrent_tasks = max;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            merged.timeout_ms = timeout_ms;
        }
        if let Some(retry_attempts) = self.retry_attempts {
            merged.retry_attempts = retry_attempts;
        }
        if let Some(dependencies) = &self.dependencies {
            merged.dependencies = dependencies.clone();
        }
        if let Some(model) = &self.model {
            merged.model = Some(model.clone());
        }
        if let Some(temperature) = self.temperature {
            merged.temperature = Some(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            merged.max_tokens = Some(max_tokens);
        }
        if let Some(threshold) = self.review_threshold {
            merged.review_threshold = Some(threshold);
        }
        merged
    }
}

/// Execution table settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSection {
    /// Terminal executions kept for status lookups and history
    #[serde(default = "default_max_retained_executions")]
    pub max_retained_executions: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_max_retained_executions() -> usize {
    1000
}

fn default_history_limit() -> usize {
    100
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_retained_executions: default_max_retained_executions(),
            history_limit: default_history_limit(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid agent ID format: {0}")]
    InvalidAgentId(String),
    #[error("Stage '{stage_id}' references undeclared agent type '{agent_type}'")]
    UnknownAgentType { stage_id: String, agent_type: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for section in self.agents.values() {
            section.configuration.validate()?;
        }

        self.pipeline
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        for stage in &self.pipeline.stages {
            for agent_type in &stage.agent_types {
                if !self.agents.contains_key(agent_type) {
                    return Err(ConfigError::UnknownAgentType {
                        stage_id: stage.id.clone(),
                        agent_type: agent_type.clone(),
                    });
                }
            }
        }

        if self.execution.history_limit == 0 {
            return Err(ConfigError::InvalidConfig(
                "execution.history_limit must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Read the provider API key from the configured environment variable
    pub fn get_llm_api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.llm.api_key_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.llm.api_key_env.clone()))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[llm]
provider = "anthropic"
api_key_env = "ANTHROPIC_API_KEY"
default_model = "claude-3-5-haiku-20241022"

[pipeline]
id = "email-triage"
name = "Email triage"
failure_strategy = "stop"

[[pipeline.stages]]
id = "triage"
agent_types = ["classifier"]

[agents.classifier]
id = "classifier-1"
instructions = "Classify the email."
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Validate agent ID format
fn validate_agent_id(agent_id: &str) -> Result<(), ConfigError> {
    let valid_chars = agent_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if agent_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidAgentId(format!(
            "Agent ID '{agent_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
