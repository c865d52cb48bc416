//! Execution records and the table that owns them
//!
//! A [`PipelineExecution`] follows
//! `Initialized -> Running -> {Completed | Failed | Cancelled}` with
//! `Running <-> Paused` on the side. Once terminal, a record accepts no
//! further changes.

use crate::agent::task::AgentResult;
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Initialized,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Initialized, Running | Failed | Cancelled)
                | (Running, Paused | Completed | Failed | Cancelled)
                | (Paused, Running)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Initialized => "initialized",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded stage failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub stage_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Mirrors the stage's `retry_on_failure`
    pub recoverable: bool,
}

impl ExecutionError {
    pub fn new(stage_id: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            stage_id: stage_id.into(),
            message: message.into(),
            timestamp: Utc::now(),
            recoverable,
        }
    }
}

/// Run-time record of one pipeline invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub id: Uuid,
    pub pipeline_id: String,
    pub email_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub completed_stages: Vec<String>,
    pub failed_stages: Vec<String>,
    pub skipped_stages: Vec<String>,
    /// Every agent result produced so far, keyed `<stageId>:<agentType>`
    pub results: BTreeMap<String, AgentResult>,
    pub errors: Vec<ExecutionError>,
    /// Stage running now, or about to run after a pause
    pub current_stage: Option<String>,
    /// Attempts made per stage, including the first
    pub stage_attempts: HashMap<String, u32>,
}

impl PipelineExecution {
    pub fn new(pipeline_id: impl Into<String>, email_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id: pipeline_id.into(),
            email_id: email_id.into(),
            start_time: Utc::now(),
            end_time: None,
            status: ExecutionStatus::Initialized,
            completed_stages: Vec::new(),
            failed_stages: Vec::new(),
            skipped_stages: Vec::new(),
            results: BTreeMap::new(),
            errors: Vec::new(),
            current_stage: None,
            stage_attempts: HashMap::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock time so far, or total once terminal
    pub fn duration_ms(&self) -> u64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds().max(0) as u64
    }

    /// Move to `next`, stamping `end_time` when it is terminal
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
            self.current_stage = None;
        }
        Ok(())
    }

    pub fn set_current_stage(&mut self, stage_id: &str) -> bool {
        self.mutate(|e| e.current_stage = Some(stage_id.to_string()))
    }

    pub fn record_attempt(&mut self, stage_id: &str) -> bool {
        self.mutate(|e| *e.stage_attempts.entry(stage_id.to_string()).or_insert(0) += 1)
    }

    pub fn complete_stage(
        &mut self,
        stage_id: &str,
        results: BTreeMap<String, AgentResult>,
    ) -> bool {
        self.mutate(|e| {
            e.store_results(stage_id, results);
            e.completed_stages.push(stage_id.to_string());
        })
    }

    pub fn fail_stage(
        &mut self,
        stage_id: &str,
        results: BTreeMap<String, AgentResult>,
        error: ExecutionError,
    ) -> bool {
        self.mutate(|e| {
            e.store_results(stage_id, results);
            e.failed_stages.push(stage_id.to_string());
            e.errors.push(error);
        })
    }

    pub fn skip_stage(&mut self, stage_id: &str) -> bool {
        self.mutate(|e| e.skipped_stages.push(stage_id.to_string()))
    }

    /// Apply `f` unless the record is terminal; returns whether it was applied
    fn mutate(&mut self, f: impl FnOnce(&mut Self)) -> bool {
        if self.is_terminal() {
            debug!(
                execution_id = %self.id,
                status = %self.status,
                "Ignoring update to finished execution"
            );
            return false;
        }
        f(self);
        true
    }

    fn store_results(&mut self, stage_id: &str, results: BTreeMap<String, AgentResult>) {
        for (agent_type, result) in results {
            self.results.insert(format!("{stage_id}:{agent_type}"), result);
        }
    }
}

struct Entry {
    seq: u64,
    /// Order in which the execution became terminal
    finished_seq: Option<u64>,
    execution: PipelineExecution,
}

/// Executions keyed by id, shared between runs and external controllers
///
/// Keeps at most `max_retained` terminal executions; the one that finished
/// longest ago is evicted first. Non-terminal executions are never evicted.
pub struct ExecutionTable {
    entries: RwLock<HashMap<Uuid, Entry>>,
    next_seq: AtomicU64,
    max_retained: usize,
    resumed: Notify,
}

impl ExecutionTable {
    pub fn new(max_retained: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            max_retained: max_retained.max(1),
            resumed: Notify::new(),
        }
    }

    pub fn max_retained(&self) -> usize {
        self.max_retained
    }

    pub fn insert(&self, execution: PipelineExecution) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let finished_seq = execution.is_terminal().then_some(seq);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            execution.id,
            Entry {
                seq,
                finished_seq,
                execution,
            },
        );
        Self::evict(&mut entries, self.max_retained);
    }

    pub fn get(&self, id: Uuid) -> Option<PipelineExecution> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|entry| entry.execution.clone())
    }

    pub fn status(&self, id: Uuid) -> Option<ExecutionStatus> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|entry| entry.execution.status)
    }

    /// Mutate one execution in place
    pub fn update<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut PipelineExecution) -> T,
    ) -> Result<T, PipelineError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get_mut(&id)
            .ok_or(PipelineError::ExecutionNotFound(id))?;
        let output = f(&mut entry.execution);
        if entry.execution.is_terminal() && entry.finished_seq.is_none() {
            entry.finished_seq = Some(self.next_seq.fetch_add(1, Ordering::Relaxed));
            Self::evict(&mut entries, self.max_retained);
        }
        Ok(output)
    }

    /// Apply `from -> to` if the execution is currently in `from`
    pub fn transition_if(&self, id: Uuid, from: ExecutionStatus, to: ExecutionStatus) -> bool {
        let changed = self
            .update(id, |execution| {
                execution.status == from && execution.transition(to).is_ok()
            })
            .unwrap_or(false);
        if changed {
            self.resumed.notify_waiters();
        }
        changed
    }

    /// Block while the execution is paused; returns the status that ended the
    /// wait, or `None` if the execution is unknown
    pub async fn wait_while_paused(&self, id: Uuid) -> Option<ExecutionStatus> {
        loop {
            let notified = self.resumed.notified();
            tokio::pin!(notified);
            // Register before reading the status so a resume in between is not lost
            notified.as_mut().enable();

            match self.status(id)? {
                ExecutionStatus::Paused => notified.await,
                status => return Some(status),
            }
        }
    }

    /// Most recent start first, at most `limit` entries
    pub fn history(&self, limit: usize) -> Vec<PipelineExecution> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut ordered: Vec<&Entry> = entries.values().collect();
        ordered.sort_by(|a, b| {
            b.execution
                .start_time
                .cmp(&a.execution.start_time)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        ordered
            .into_iter()
            .take(limit)
            .map(|entry| entry.execution.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(entries: &mut HashMap<Uuid, Entry>, max_retained: usize) {
        let mut terminal: Vec<(u64, Uuid)> = entries
            .values()
            .filter_map(|entry| entry.finished_seq.map(|seq| (seq, entry.execution.id)))
            .collect();
        if terminal.len() <= max_retained {
            return;
        }

        terminal.sort_unstable();
        let excess = terminal.len() - max_retained;
        for (_, id) in terminal.into_iter().take(excess) {
            entries.remove(&id);
            debug!(execution_id = %id, "Evicted finished execution");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn finished(table: &ExecutionTable) -> Uuid {
        let execution = PipelineExecution::new("p", "m");
        let id = execution.id;
        table.insert(execution);
        table
            .update(id, |e| {
                e.transition(ExecutionStatus::Running).unwrap();
                e.transition(ExecutionStatus::Completed).unwrap();
            })
            .unwrap();
        id
    }

    #[test]
    fn test_state_machine() {
        use ExecutionStatus::*;
        assert!(Initialized.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Failed));
    }

    #[test]
    fn test_terminal_transition_stamps_end_time() {
        let mut execution = PipelineExecution::new("p", "m");
        execution.transition(ExecutionStatus::Running).unwrap();
        assert!(execution.end_time.is_none());

        execution.transition(ExecutionStatus::Failed).unwrap();
        assert!(execution.end_time.is_some());
        assert!(matches!(
            execution.transition(ExecutionStatus::Running),
            Err(PipelineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_terminal_record_ignores_updates() {
        let mut execution = PipelineExecution::new("p", "m");
        execution.transition(ExecutionStatus::Running).unwrap();
        execution.transition(ExecutionStatus::Cancelled).unwrap();

        assert!(!execution.complete_stage("triage", BTreeMap::new()));
        assert!(!execution.skip_stage("triage"));
        assert!(execution.completed_stages.is_empty());
        assert!(execution.skipped_stages.is_empty());
    }

    #[test]
    fn test_fail_stage_records_error_and_results() {
        let mut execution = PipelineExecution::new("p", "m");
        execution.transition(ExecutionStatus::Running).unwrap();
        let result = AgentResult::failure("c-1", "classifier", "boom", 3);

        execution.fail_stage(
            "triage",
            BTreeMap::from([("classifier".to_string(), result)]),
            ExecutionError::new("triage", "boom", true),
        );

        assert_eq!(execution.failed_stages, vec!["triage".to_string()]);
        assert!(execution.results.contains_key("triage:classifier"));
        assert!(execution.errors[0].recoverable);
    }

    #[test]
    fn test_oldest_terminal_executions_are_evicted() {
        let table = ExecutionTable::new(2);
        let running = PipelineExecution::new("p", "m");
        let running_id = running.id;
        table.insert(running);

        let first = finished(&table);
        let second = finished(&table);
        let third = finished(&table);

        assert_eq!(table.len(), 3);
        assert!(table.get(first).is_none());
        assert!(table.get(second).is_some());
        assert!(table.get(third).is_some());
        assert!(table.get(running_id).is_some());
    }

    #[test]
    fn test_eviction_follows_finish_order() {
        let table = ExecutionTable::new(2);
        let slow = PipelineExecution::new("p", "slow");
        let slow_id = slow.id;
        table.insert(slow);
        assert!(table.transition_if(
            slow_id,
            ExecutionStatus::Initialized,
            ExecutionStatus::Running
        ));

        let first = finished(&table);
        let second = finished(&table);
        assert!(table.transition_if(slow_id, ExecutionStatus::Running, ExecutionStatus::Failed));

        assert!(table.get(first).is_none());
        assert!(table.get(second).is_some());
        let slow = table.get(slow_id).unwrap();
        assert_eq!(slow.status, ExecutionStatus::Failed);
        assert!(slow.end_time.is_some());
    }

    #[test]
    fn test_history_is_most_recent_first() {
        let table = ExecutionTable::new(10);
        let ids: Vec<Uuid> = (0..3).map(|_| finished(&table)).collect();

        let history = table.history(2);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, ids[2]);
        assert_eq!(history[1].id, ids[1]);
    }

    #[test]
    fn test_transition_if_checks_current_status() {
        let table = ExecutionTable::new(10);
        let execution = PipelineExecution::new("p", "m");
        let id = execution.id;
        table.insert(execution);

        assert!(!table.transition_if(id, ExecutionStatus::Running, ExecutionStatus::Cancelled));
        assert!(table.transition_if(id, ExecutionStatus::Initialized, ExecutionStatus::Running));
        assert!(!table.transition_if(
            Uuid::new_v4(),
            ExecutionStatus::Running,
            ExecutionStatus::Paused
        ));
    }

    #[tokio::test]
    async fn test_wait_while_paused_wakes_on_resume() {
        let table = Arc::new(ExecutionTable::new(10));
        let execution = PipelineExecution::new("p", "m");
        let id = execution.id;
        table.insert(execution);
        table.transition_if(id, ExecutionStatus::Initialized, ExecutionStatus::Running);
        table.transition_if(id, ExecutionStatus::Running, ExecutionStatus::Paused);

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait_while_paused(id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        table.transition_if(id, ExecutionStatus::Paused, ExecutionStatus::Running);
        let status = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, Some(ExecutionStatus::Running));
    }
}
