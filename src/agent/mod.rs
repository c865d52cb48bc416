//! Agents: the execution contract around one unit of LLM-backed work
//!
//! An [`Agent`] wraps an [`AgentWorker`] with input validation, timeouts,
//! concurrency limits, observer notifications and failure conversion. The
//! [`AgentOrchestrator`] is the registry the pipeline dispatches through.

pub mod confidence;
pub mod events;
pub mod executor;
pub mod factory;
pub mod llm_worker;
pub mod orchestrator;
pub mod structured;
pub mod task;
pub mod worker;

pub use confidence::{explicit_confidence, extract_confidence};
pub use events::{
    AgentEvent, AgentEventKind, ChannelObserver, ExecutionObserver, MetricsObserver,
    TracingObserver,
};
pub use executor::Agent;
pub use factory::{AgentFactory, WorkerConstructor};
pub use llm_worker::LlmWorker;
pub use orchestrator::AgentOrchestrator;
pub use structured::{parse_structured_response, FieldType, ResponseSchema};
pub use task::{
    AgentContext, AgentResult, AgentStatus, AgentTask, ProcessOutput, TaskPriority,
};
pub use worker::AgentWorker;
