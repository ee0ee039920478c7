use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued behind the start limit; no session yet.
    Pending,
    /// Holds a start slot; session creation and first prompt are in flight.
    Starting,
    /// Session exists and accepted its prompt; waiting for the idle signal.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Starting => "starting",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied request to run an agent in a background session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchInput {
    pub agent: String,
    pub prompt: String,
    pub description: String,
    pub parent_session_id: String,
}

impl LaunchInput {
    pub fn new(
        agent: impl Into<String>,
        prompt: impl Into<String>,
        description: impl Into<String>,
        parent_session_id: impl Into<String>,
    ) -> Self {
        Self {
            agent: agent.into(),
            prompt: prompt.into(),
            description: description.into(),
            parent_session_id: parent_session_id.into(),
        }
    }
}

/// One supervised background agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundTask {
    pub id: String,
    pub agent: String,
    pub prompt: String,
    pub description: String,
    pub parent_session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackgroundTask {
    pub fn new(id: impl Into<String>, input: LaunchInput) -> Self {
        Self {
            id: id.into(),
            agent: input.agent,
            prompt: input.prompt,
            description: input.description,
            parent_session_id: input.parent_session_id,
            session_id: None,
            status: TaskStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
