//! Server-side wire protocol.
//!
//! Outbound frames carry a `status` field next to the task fields so
//! simple consumers can render them without tracking state. Clients on
//! this workspace decode them with [`tasklink_core::Envelope`], which
//! ignores the extra fields.

use serde::{Deserialize, Serialize};
use tasklink_core::{TaskId, envelope::unix_timestamp};

/// Route the channel endpoint is mounted on.
pub const CHANNEL_ROUTE: &str = "/ws/{client_id}";

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keepalive; answered with a pong echoing `timestamp`.
    Ping {
        #[serde(default)]
        timestamp: Option<f64>,
    },
    /// Reply to a server heartbeat.
    Pong {
        #[serde(default)]
        timestamp: Option<f64>,
    },
    /// Connection status query.
    Status,
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Greeting sent once per connection.
    Connected { client_id: String, message: String },
    Start {
        task_id: TaskId,
        status: &'static str,
        message: String,
        timestamp: f64,
    },
    Progress {
        task_id: TaskId,
        progress: f64,
        status: &'static str,
        message: String,
        timestamp: f64,
    },
    Complete {
        task_id: TaskId,
        status: &'static str,
        result: String,
        message: String,
        timestamp: f64,
    },
    /// Task failure, or a protocol complaint when `task_id` is absent.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    Ping { timestamp: f64 },
    Pong { timestamp: Option<f64> },
    Status {
        connected: bool,
        total_connections: usize,
    },
}

impl ServerMessage {
    #[must_use]
    pub fn connected(client_id: &str) -> Self {
        Self::Connected {
            client_id: client_id.to_string(),
            message: "Channel established".to_string(),
        }
    }

    #[must_use]
    pub fn start(task_id: &str) -> Self {
        Self::Start {
            task_id: task_id.to_string(),
            status: "processing",
            message: "Task started".to_string(),
            timestamp: unix_timestamp(),
        }
    }

    #[must_use]
    pub fn progress(task_id: &str, progress: f64, message: &str) -> Self {
        Self::Progress {
            task_id: task_id.to_string(),
            progress,
            status: "processing",
            message: message.to_string(),
            timestamp: unix_timestamp(),
        }
    }

    #[must_use]
    pub fn complete(task_id: &str, result: &str) -> Self {
        Self::Complete {
            task_id: task_id.to_string(),
            status: "completed",
            result: result.to_string(),
            message: "Task completed".to_string(),
            timestamp: unix_timestamp(),
        }
    }

    #[must_use]
    pub fn task_error(task_id: &str, error: &str) -> Self {
        Self::Error {
            task_id: Some(task_id.to_string()),
            status: Some("error"),
            error: Some(error.to_string()),
            message: "Task failed".to_string(),
            timestamp: Some(unix_timestamp()),
        }
    }

    /// Protocol complaint not tied to any task.
    #[must_use]
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::Error {
            task_id: None,
            status: None,
            error: None,
            message: message.into(),
            timestamp: None,
        }
    }

    /// Heartbeat stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: unix_timestamp(),
        }
    }

    /// Encode to a JSON text frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outcome of parsing one inbound frame.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Message(ClientMessage),
    /// Valid JSON with a `type` this endpoint does not handle.
    Unknown(String),
    /// Not a JSON object.
    Invalid,
}

/// Parse an inbound text frame.
#[must_use]
pub fn parse_client_frame(text: &str) -> Inbound {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return Inbound::Invalid;
    };
    if !value.is_object() {
        return Inbound::Invalid;
    }
    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    serde_json::from_value(value).map_or(Inbound::Unknown(kind), Inbound::Message)
}
