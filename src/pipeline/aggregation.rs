//! Folding per-agent results into one processing result
//!
//! Two policies ship with the crate. [`HighestConfidence`] (the default) lets
//! the most confident successful result speak for the run; ties go to the
//! result from the earliest completed stage. [`WeightedAverage`] averages the
//! confidence of every successful result using per-stage weights and returns
//! all their payloads. Anything else can implement [`ResultAggregator`].

use crate::agent::task::{AgentResult, AgentStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Aggregation policy selectable from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    #[default]
    HighestConfidence,
    WeightedAverage,
}

impl AggregationPolicy {
    pub fn build(self, stage_weights: &HashMap<String, f64>) -> Arc<dyn ResultAggregator> {
        match self {
            AggregationPolicy::HighestConfidence => Arc::new(HighestConfidence),
            AggregationPolicy::WeightedAverage => {
                Arc::new(WeightedAverage::new(stage_weights.clone()))
            }
        }
    }
}

/// Outcome of folding a run's results
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub confidence: f64,
    pub data: Value,
    pub reasoning: String,
    /// Result key the aggregate was taken from, when a single result won
    pub source: Option<String>,
    pub needs_review: bool,
}

impl Aggregate {
    fn nothing_succeeded() -> Self {
        Self {
            confidence: 0.0,
            data: Value::Null,
            reasoning: "No agent produced a usable result".to_string(),
            source: None,
            needs_review: true,
        }
    }
}

pub trait ResultAggregator: Send + Sync {
    fn name(&self) -> &str;

    /// Fold `results` (keyed `<stageId>:<agentType>`) into one outcome.
    /// `stage_order` lists completed stages in execution order.
    fn aggregate(&self, stage_order: &[String], results: &BTreeMap<String, AgentResult>)
        -> Aggregate;
}

fn stage_of(key: &str) -> &str {
    key.split_once(':').map_or(key, |(stage, _)| stage)
}

fn any_needs_review<'a>(mut results: impl Iterator<Item = &'a AgentResult>) -> bool {
    results.any(|result| result.status == AgentStatus::NeedsReview)
}

/// Successful results in stage order, then key order within a stage
fn successful_in_order<'a>(
    stage_order: &'a [String],
    results: &'a BTreeMap<String, AgentResult>,
) -> impl Iterator<Item = (&'a String, &'a AgentResult)> {
    stage_order.iter().flat_map(move |stage| {
        results
            .iter()
            .filter(move |(key, result)| stage_of(key) == stage && result.is_success())
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HighestConfidence;

impl ResultAggregator for HighestConfidence {
    fn name(&self) -> &str {
        "highest_confidence"
    }

    fn aggregate(
        &self,
        stage_order: &[String],
        results: &BTreeMap<String, AgentResult>,
    ) -> Aggregate {
        let mut best: Option<(&String, &AgentResult)> = None;
        for (key, result) in successful_in_order(stage_order, results) {
            // Strictly greater keeps the earliest result on ties
            if best.map_or(true, |(_, current)| result.confidence > current.confidence) {
                best = Some((key, result));
            }
        }

        match best {
            Some((key, result)) => Aggregate {
                confidence: result.confidence,
                data: result.data.clone(),
                reasoning: result.reasoning.clone(),
                source: Some(key.clone()),
                needs_review: any_needs_review(results.values()),
            },
            None => Aggregate::nothing_succeeded(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WeightedAverage {
    stage_weights: HashMap<String, f64>,
}

impl WeightedAverage {
    /// Stages without an entry weigh 1.0
    pub fn new(stage_weights: HashMap<String, f64>) -> Self {
        Self { stage_weights }
    }

    fn weight(&self, stage: &str) -> f64 {
        self.stage_weights.get(stage).copied().unwrap_or(1.0)
    }
}

impl ResultAggregator for WeightedAverage {
    fn name(&self) -> &str {
        "weighted_average"
    }

    fn aggregate(
        &self,
        stage_order: &[String],
        results: &BTreeMap<String, AgentResult>,
    ) -> Aggregate {
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        let mut data = Map::new();

        for (key, result) in successful_in_order(stage_order, results) {
            let weight = self.weight(stage_of(key));
            weighted_sum += weight * result.confidence;
            total_weight += weight;
            data.insert(key.clone(), result.data.clone());
        }

        if data.is_empty() {
            return Aggregate::nothing_succeeded();
        }

        let confidence = if total_weight > 0.0 {
            (weighted_sum / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Aggregate {
            confidence,
            reasoning: format!("Weighted average over {} agent results", data.len()),
            data: Value::Object(data),
            source: None,
            needs_review: any_needs_review(results.values()),
        }
    }
}

/// What a completed run returns to its caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub execution_id: Uuid,
    pub pipeline_id: String,
    pub email_id: String,
    pub confidence: f64,
    pub data: Value,
    pub reasoning: String,
    pub source: Option<String>,
    pub needs_review: bool,
    pub aggregation: String,
    pub completed_stages: Vec<String>,
    pub failed_stages: Vec<String>,
    pub skipped_stages: Vec<String>,
    pub results: BTreeMap<String, AgentResult>,
    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
}
