//! Canonical task record.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Task identifier, chosen by the submitter and correlated across the
/// submission call and the channel.
pub type TaskId = String;

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Tracked locally, no channel traffic seen yet.
    Pending,
    /// Generation is running.
    Processing,
    /// Generation finished with a result.
    Completed,
    /// Generation failed.
    Error,
}

impl TaskStatus {
    /// Whether no further status change is allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// One unit of tracked asynchronous work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Correlation id.
    pub id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Progress percentage, 0 to 100.
    pub progress: u8,
    /// Human-readable status line.
    pub message: String,
    /// Result reference, present only when completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Failure description, present only when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation timestamp (Unix epoch milliseconds).
    pub created_at: i64,
    /// Last update timestamp (Unix epoch milliseconds).
    pub updated_at: i64,
}

impl Task {
    /// Create a task in the given status.
    #[must_use]
    pub fn new(id: impl Into<TaskId>, status: TaskStatus) -> Self {
        let timestamp = now_millis();
        Self {
            id: id.into(),
            status,
            progress: 0,
            message: String::new(),
            result: None,
            error: None,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    /// Whether the task reached `Completed` or `Error`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn touch(&mut self) {
        // Keep updated_at strictly monotonic even within one millisecond.
        self.updated_at = now_millis().max(self.updated_at + 1);
    }
}

/// Current wall-clock time in Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
