//! Process-wide pipeline metrics
//!
//! Counters are plain atomics so the hot path never takes a lock; only the
//! duration samples sit behind a mutex. Sample buffers keep the most recent
//! [`MAX_DURATION_SAMPLES`] values.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_DURATION_SAMPLES: usize = 1000;

#[derive(Default)]
struct Counter(AtomicU64);

impl Counter {
    fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn decr(&self) {
        // Saturating so a stray decrement after reset() cannot wrap
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn clear(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Samples(Mutex<Vec<u64>>);

impl Samples {
    fn record(&self, value_ms: u64) {
        let mut samples = self.0.lock().unwrap_or_else(|e| e.into_inner());
        samples.push(value_ms);
        if samples.len() > MAX_DURATION_SAMPLES {
            samples.remove(0);
        }
    }

    fn stats(&self) -> DurationStats {
        let samples = self.0.lock().unwrap_or_else(|e| e.into_inner());
        DurationStats::from_samples(&samples)
    }

    fn clear(&self) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Thread-safe metrics collector using atomics and mutexes
#[derive(Default)]
pub struct MetricsCollector {
    executions_started: Counter,
    executions_running: Counter,
    executions_completed: Counter,
    executions_failed: Counter,
    executions_cancelled: Counter,
    execution_durations: Samples,

    stages_completed: Counter,
    stages_failed: Counter,
    stages_skipped: Counter,
    stages_retried: Counter,

    agent_calls_started: Counter,
    agent_calls_in_flight: Counter,
    agent_calls_succeeded: Counter,
    agent_calls_failed: Counter,
    agent_calls_timed_out: Counter,
    agent_durations: Samples,

    started_at: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let collector = Self::default();
        collector.started_at.store(now_secs(), Ordering::Relaxed);
        collector
    }

    pub fn execution_started(&self) {
        self.executions_started.incr();
        self.executions_running.incr();
    }

    pub fn execution_completed(&self, duration_ms: u64) {
        self.executions_completed.incr();
        self.executions_running.decr();
        self.execution_durations.record(duration_ms);
    }

    pub fn execution_failed(&self, duration_ms: u64) {
        self.executions_failed.incr();
        self.executions_running.decr();
        self.execution_durations.record(duration_ms);
    }

    pub fn execution_cancelled(&self) {
        self.executions_cancelled.incr();
        self.executions_running.decr();
    }

    pub fn stage_completed(&self) {
        self.stages_completed.incr();
    }

    pub fn stage_failed(&self) {
        self.stages_failed.incr();
    }

    pub fn stage_skipped(&self) {
        self.stages_skipped.incr();
    }

    pub fn stage_retried(&self) {
        self.stages_retried.incr();
    }

    pub fn agent_call_started(&self) {
        self.agent_calls_started.incr();
        self.agent_calls_in_flight.incr();
    }

    pub fn agent_call_succeeded(&self, duration_ms: u64) {
        self.agent_calls_succeeded.incr();
        self.agent_calls_in_flight.decr();
        self.agent_durations.record(duration_ms);
    }

    pub fn agent_call_failed(&self, duration_ms: u64) {
        self.agent_calls_failed.incr();
        self.agent_calls_in_flight.decr();
        self.agent_durations.record(duration_ms);
    }

    /// Timeouts are also reported as failures; this only counts the subset
    pub fn agent_call_timed_out(&self) {
        self.agent_calls_timed_out.incr();
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = now_secs();
        MetricsSnapshot {
            executions: ExecutionMetrics {
                started: self.executions_started.get(),
                running: self.executions_running.get(),
                completed: self.executions_completed.get(),
                failed: self.executions_failed.get(),
                cancelled: self.executions_cancelled.get(),
                duration: self.execution_durations.stats(),
            },
            stages: StageMetrics {
                completed: self.stages_completed.get(),
                failed: self.stages_failed.get(),
                skipped: self.stages_skipped.get(),
                retried: self.stages_retried.get(),
            },
            agents: AgentCallMetrics {
                started: self.agent_calls_started.get(),
                in_flight: self.agent_calls_in_flight.get(),
                succeeded: self.agent_calls_succeeded.get(),
                failed: self.agent_calls_failed.get(),
                timed_out: self.agent_calls_timed_out.get(),
                duration: self.agent_durations.stats(),
            },
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }

    /// Zero every counter and drop all samples
    pub fn reset(&self) {
        for counter in [
            &self.executions_started,
            &self.executions_running,
            &self.executions_completed,
            &self.executions_failed,
            &self.executions_cancelled,
            &self.stages_completed,
            &self.stages_failed,
            &self.stages_skipped,
            &self.stages_retried,
            &self.agent_calls_started,
            &self.agent_calls_in_flight,
            &self.agent_calls_succeeded,
            &self.agent_calls_failed,
            &self.agent_calls_timed_out,
        ] {
            counter.clear();
        }
        self.execution_durations.clear();
        self.agent_durations.clear();
        self.started_at.store(now_secs(), Ordering::Relaxed);
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DurationStats {
    pub samples: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: u64,
}

impl DurationStats {
    fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        Self {
            samples: sorted.len(),
            avg_ms: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            max_ms: sorted.last().copied().unwrap_or(0),
        }
    }
}

/// Nearest-rank percentile over an already sorted slice
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)] as f64
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub executions: ExecutionMetrics,
    pub stages: StageMetrics,
    pub agents: AgentCallMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionMetrics {
    pub started: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub duration: DurationStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageMetrics {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub retried: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentCallMetrics {
    pub started: u64,
    pub in_flight: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub duration: DurationStats,
}
