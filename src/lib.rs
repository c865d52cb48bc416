//! Email Agent Pipeline
//!
//! Runs inbound email through a configurable sequence of stages, each
//! dispatching one or more confidence-scored LLM agents, and folds their
//! results into a single processing result.
//!
//! # Overview
//!
//! - [`agent`]: the agent execution contract, workers, factory and orchestrator
//! - [`pipeline`]: stage definitions, the execution engine and aggregation
//! - [`llm`]: provider-agnostic completion interface and the Anthropic client
//! - [`config`]: TOML application configuration
//! - [`observability`]: structured logging and in-process metrics
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use email_agent_pipeline::agent::{Agent, AgentOrchestrator};
//! use email_agent_pipeline::config::AgentConfiguration;
//! use email_agent_pipeline::email::Email;
//! use email_agent_pipeline::pipeline::{Pipeline, PipelineConfiguration, Stage};
//! use email_agent_pipeline::testing::ScriptedWorker;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Arc::new(AgentOrchestrator::new());
//! let agent = Agent::initialize(
//!     Arc::new(ScriptedWorker::new("classifier")),
//!     AgentConfiguration::new("classifier-1"),
//! )?;
//! orchestrator.register_agent_type("classifier", Arc::new(agent));
//!
//! let config = PipelineConfiguration::new("triage", "Email triage")
//!     .with_stage(Stage::new("classify", ["classifier"]));
//! let pipeline = Pipeline::new(config, orchestrator)?;
//!
//! let email = Email::new("msg-1", "alice@example.com", "Invoice", "Please pay");
//! let result = pipeline.execute(email).await?;
//! println!("confidence {}", result.confidence);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod email;
pub mod error;
pub mod health;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod testing;

pub use agent::{Agent, AgentOrchestrator, AgentResult, AgentTask};
pub use config::{AgentConfiguration, AppConfig, ConfigError};
pub use email::Email;
pub use error::{AgentError, PipelineError};
pub use pipeline::{Pipeline, PipelineConfiguration, ProcessingResult, Stage};
