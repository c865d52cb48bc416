//! The inbound item a pipeline run processes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Body text longer than this is cut before it is handed to agents
const MAX_AGENT_BODY_CHARS: usize = 20_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Email {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

impl Email {
    pub fn new(
        id: impl Into<String>,
        from: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: Vec::new(),
            cc: Vec::new(),
            subject: subject.into(),
            body: body.into(),
            received_at: Utc::now(),
            headers: HashMap::new(),
            attachments: Vec::new(),
        }
    }

    /// JSON projection handed to agents as task input
    pub fn to_agent_input(&self) -> Value {
        let body: String = self.body.chars().take(MAX_AGENT_BODY_CHARS).collect();
        let attachments: Vec<&str> = self
            .attachments
            .iter()
            .map(|a| a.filename.as_str())
            .collect();

        json!({
            "email_id": self.id,
            "from": self.from,
            "to": self.to,
            "cc": self.cc,
            "subject": self.subject,
            "body": body,
            "body_truncated": self.body.chars().count() > MAX_AGENT_BODY_CHARS,
            "received_at": self.received_at.to_rfc3339(),
            "attachments": attachments,
        })
    }
}
