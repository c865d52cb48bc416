//! Agent health reporting
//!
//! Health checks never fail: a broken provider shows up as `healthy = false`
//! with an entry in `issues`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of one agent health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealthStatus {
    pub agent_id: String,
    pub agent_type: String,
    pub healthy: bool,
    pub issues: Vec<String>,
    pub last_check: DateTime<Utc>,
    pub response_time_ms: u64,
}

impl AgentHealthStatus {
    pub fn healthy(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        response_time_ms: u64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            healthy: true,
            issues: Vec::new(),
            last_check: Utc::now(),
            response_time_ms,
        }
    }

    pub fn unhealthy(
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        issue: impl Into<String>,
        response_time_ms: u64,
    ) -> Self {
        Self {
            healthy: false,
            issues: vec![issue.into()],
            ..Self::healthy(agent_id, agent_type, response_time_ms)
        }
    }

    /// Record an additional problem; any issue makes the agent unhealthy
    pub fn with_issue(mut self, issue: impl Into<String>) -> Self {
        self.healthy = false;
        self.issues.push(issue.into());
        self
    }
}

/// Health of every registered agent, keyed by agent type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    pub agents: BTreeMap<String, AgentHealthStatus>,
}

impl HealthReport {
    /// An empty registry counts as healthy
    pub fn from_statuses(agents: BTreeMap<String, AgentHealthStatus>) -> Self {
        Self {
            healthy: agents.values().all(|status| status.healthy),
            checked_at: Utc::now(),
            agents,
        }
    }

    pub fn unhealthy_agents(&self) -> Vec<&str> {
        self.agents
            .iter()
            .filter(|(_, status)| !status.healthy)
            .map(|(agent_type, _)| agent_type.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unhealthy_status_carries_issue() {
        let status = AgentHealthStatus::unhealthy("c-1", "classifier", "provider down", 12);
        assert!(!status.healthy);
        assert_eq!(status.issues, vec!["provider down".to_string()]);
        assert_eq!(status.response_time_ms, 12);
    }

    #[test]
    fn test_with_issue_marks_unhealthy() {
        let status = AgentHealthStatus::healthy("c-1", "classifier", 3).with_issue("shut down");
        assert!(!status.healthy);
        assert_eq!(status.issues.len(), 1);
    }

    #[test]
    fn test_report_requires_every_agent_healthy() {
        let mut agents = BTreeMap::new();
        agents.insert(
            "classifier".to_string(),
            AgentHealthStatus::healthy("c-1", "classifier", 5),
        );
        agents.insert(
            "router".to_string(),
            AgentHealthStatus::unhealthy("r-1", "router", "timeout", 5),
        );

        let report = HealthReport::from_statuses(agents);
        assert!(!report.healthy);
        assert_eq!(report.unhealthy_agents(), vec!["router"]);
    }

    #[test]
    fn test_empty_report_is_healthy() {
        assert!(HealthReport::from_statuses(BTreeMap::new()).healthy);
    }
}
