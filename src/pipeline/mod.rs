//! Multi-stage pipeline over registered agents
//!
//! A [`PipelineConfiguration`] lists stages; a [`Pipeline`] runs an email
//! through them, tracking each run as a [`PipelineExecution`] and folding the
//! agent results into a [`ProcessingResult`].

pub mod aggregation;
pub mod context;
pub mod engine;
pub mod execution;
pub mod retry;
pub mod types;

pub use aggregation::{
    Aggregate, AggregationPolicy, HighestConfidence, ProcessingResult, ResultAggregator,
    WeightedAverage,
};
pub use context::PipelineContext;
pub use engine::{Pipeline, DEFAULT_HISTORY_LIMIT, DEFAULT_MAX_RETAINED_EXECUTIONS};
pub use execution::{ExecutionError, ExecutionStatus, ExecutionTable, PipelineExecution};
pub use retry::{Backoff, RetryPolicy};
pub use types::{ConditionFn, FailureStrategy, PipelineConfiguration, Stage, StageCondition};
