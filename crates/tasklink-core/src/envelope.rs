//! Wire envelope for the task-progress channel.
//!
//! Every frame is a JSON object with a `type` field plus type-specific
//! fields. Two keys have been used for task correlation over time:
//! `task_id` (current) and `taskId` (legacy). Both are accepted here and
//! folded into a single field so nothing past decoding ever sees the
//! legacy name. When both are present `task_id` wins.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::task::TaskId;

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Start,
    Progress,
    Complete,
    Error,
    Ping,
    Pong,
    /// Server greeting sent right after the channel opens.
    Connected,
    /// Connection status query and its reply.
    Status,
}

impl MessageKind {
    /// Wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Progress => "progress",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Connected => "connected",
            Self::Status => "status",
        }
    }

    /// Whether this type carries a task correlation field.
    #[must_use]
    pub const fn is_task_message(self) -> bool {
        matches!(
            self,
            Self::Start | Self::Progress | Self::Complete | Self::Error
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "start" => Self::Start,
            "progress" => Self::Progress,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "connected" => Self::Connected,
            "status" => Self::Status,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        })
    }
}

/// Decode failure for an inbound frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("{0} message has no task correlation field")]
    MissingTaskId(MessageKind),
    #[error("{kind} message is missing `{field}`")]
    MissingField {
        kind: MessageKind,
        field: &'static str,
    },
    #[error("Invalid progress value: {0}")]
    InvalidProgress(f64),
}

/// A decoded, typed channel message.
///
/// Envelopes are plain values: the router hands them to listeners by
/// reference and drops them once dispatch returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Start {
        task_id: TaskId,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    Progress {
        task_id: TaskId,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    Complete {
        task_id: TaskId,
        result: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    Error {
        task_id: TaskId,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    Connected {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Status {
        #[serde(skip_serializing_if = "Option::is_none")]
        connected: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_connections: Option<u64>,
    },
}

impl Envelope {
    /// Decode a text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not JSON, has an unknown `type`, or
    /// lacks a field its type requires.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        Self::try_from(raw)
    }

    /// Encode to a JSON text frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Message type.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Start { .. } => MessageKind::Start,
            Self::Progress { .. } => MessageKind::Progress,
            Self::Complete { .. } => MessageKind::Complete,
            Self::Error { .. } => MessageKind::Error,
            Self::Ping { .. } => MessageKind::Ping,
            Self::Pong { .. } => MessageKind::Pong,
            Self::Connected { .. } => MessageKind::Connected,
            Self::Status { .. } => MessageKind::Status,
        }
    }

    /// Task correlation id, for task messages.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Start { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::Complete { task_id, .. }
            | Self::Error { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// Liveness traffic is dropped rather than retried when the channel
    /// is down.
    #[must_use]
    pub const fn is_liveness(&self) -> bool {
        matches!(self, Self::Ping { .. } | Self::Pong { .. })
    }

    /// Whether this message moves a task into a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Heartbeat ping stamped with the current time.
    #[must_use]
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Some(unix_timestamp()),
        }
    }

    /// Pong answering a ping.
    #[must_use]
    pub const fn pong(timestamp: Option<f64>) -> Self {
        Self::Pong { timestamp }
    }

    /// Status query.
    #[must_use]
    pub const fn status_query() -> Self {
        Self::Status {
            connected: None,
            total_connections: None,
        }
    }

    /// Task start.
    #[must_use]
    pub fn start(task_id: impl Into<TaskId>, message: Option<String>) -> Self {
        Self::Start {
            task_id: task_id.into(),
            message,
            timestamp: Some(unix_timestamp()),
        }
    }

    /// Task progress update.
    #[must_use]
    pub fn progress(task_id: impl Into<TaskId>, progress: u8, message: Option<String>) -> Self {
        Self::Progress {
            task_id: task_id.into(),
            progress: progress.min(100),
            message,
            timestamp: Some(unix_timestamp()),
        }
    }

    /// Task completion.
    #[must_use]
    pub fn complete(task_id: impl Into<TaskId>, result: impl Into<String>) -> Self {
        Self::Complete {
            task_id: task_id.into(),
            result: result.into(),
            message: None,
            timestamp: Some(unix_timestamp()),
        }
    }

    /// Task failure.
    #[must_use]
    pub fn error(task_id: impl Into<TaskId>, error: Option<String>) -> Self {
        Self::Error {
            task_id: task_id.into(),
            error,
            message: None,
            timestamp: Some(unix_timestamp()),
        }
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawEnvelope::deserialize(deserializer)?;
        Self::try_from(raw).map_err(serde::de::Error::custom)
    }
}

/// Field bag covering every message type.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    task_id: Option<String>,
    #[serde(rename = "taskId")]
    legacy_task_id: Option<String>,
    progress: Option<f64>,
    message: Option<String>,
    result: Option<Value>,
    error: Option<Value>,
    timestamp: Option<f64>,
    client_id: Option<String>,
    connected: Option<bool>,
    total_connections: Option<u64>,
}

impl RawEnvelope {
    fn correlation(&mut self, kind: MessageKind) -> Result<TaskId, ProtocolError> {
        [self.task_id.take(), self.legacy_task_id.take()]
            .into_iter()
            .flatten()
            .find(|id| !id.is_empty())
            .ok_or(ProtocolError::MissingTaskId(kind))
    }
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(mut raw: RawEnvelope) -> Result<Self, ProtocolError> {
        let kind: MessageKind = raw.kind.parse()?;
        let envelope = match kind {
            MessageKind::Start => Envelope::Start {
                task_id: raw.correlation(kind)?,
                message: raw.message,
                timestamp: raw.timestamp,
            },
            MessageKind::Progress => {
                let task_id = raw.correlation(kind)?;
                let value = raw.progress.ok_or(ProtocolError::MissingField {
                    kind,
                    field: "progress",
                })?;
                Envelope::Progress {
                    task_id,
                    progress: clamp_progress(value)?,
                    message: raw.message,
                    timestamp: raw.timestamp,
                }
            }
            MessageKind::Complete => {
                let task_id = raw.correlation(kind)?;
                let result = raw
                    .result
                    .filter(|v| !v.is_null())
                    .map(value_text)
                    .ok_or(ProtocolError::MissingField {
                        kind,
                        field: "result",
                    })?;
                Envelope::Complete {
                    task_id,
                    result,
                    message: raw.message,
                    timestamp: raw.timestamp,
                }
            }
            MessageKind::Error => Envelope::Error {
                task_id: raw.correlation(kind)?,
                error: raw.error.filter(|v| !v.is_null()).map(value_text),
                message: raw.message,
                timestamp: raw.timestamp,
            },
            MessageKind::Ping => Envelope::Ping {
                timestamp: raw.timestamp,
            },
            MessageKind::Pong => Envelope::Pong {
                timestamp: raw.timestamp,
            },
            MessageKind::Connected => Envelope::Connected {
                client_id: raw.client_id,
                message: raw.message,
            },
            MessageKind::Status => Envelope::Status {
                connected: raw.connected,
                total_connections: raw.total_connections,
            },
        };
        Ok(envelope)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_progress(value: f64) -> Result<u8, ProtocolError> {
    if !value.is_finite() {
        return Err(ProtocolError::InvalidProgress(value));
    }
    Ok(value.round().clamp(0.0, 100.0) as u8)
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Seconds since the Unix epoch, as carried in `timestamp` fields.
#[must_use]
pub fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_current_field_name() {
        let env = Envelope::decode(r#"{"type":"start","task_id":"t1","message":"go"}"#).unwrap();
        assert_eq!(env.kind(), MessageKind::Start);
        assert_eq!(env.task_id(), Some("t1"));
    }

    #[test]
    fn test_decode_legacy_field_name() {
        let env = Envelope::decode(r#"{"type":"progress","taskId":"t2","progress":10}"#).unwrap();
        assert_eq!(env.task_id(), Some("t2"));
    }

    #[test]
    fn test_current_name_wins_when_both_present() {
        let env =
            Envelope::decode(r#"{"type":"start","taskId":"old","task_id":"new"}"#).unwrap();
        assert_eq!(env.task_id(), Some("new"));
    }

    #[test]
    fn test_empty_current_name_falls_back_to_legacy() {
        let env = Envelope::decode(r#"{"type":"start","task_id":"","taskId":"t3"}"#).unwrap();
        assert_eq!(env.task_id(), Some("t3"));
    }

    #[test]
    fn test_missing_correlation_is_rejected() {
        let err = Envelope::decode(r#"{"type":"error","message":"bad json"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingTaskId(MessageKind::Error)));
    }

    #[test]
    fn test_complete_requires_result() {
        let err = Envelope::decode(r#"{"type":"complete","task_id":"t1"}"#).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MissingField {
                field: "result",
                ..
            }
        ));
    }

    #[test]
    fn test_progress_is_rounded_and_clamped() {
        let env = Envelope::decode(r#"{"type":"progress","task_id":"t","progress":42.6}"#).unwrap();
        assert!(matches!(env, Envelope::Progress { progress: 43, .. }));

        let env = Envelope::decode(r#"{"type":"progress","task_id":"t","progress":250}"#).unwrap();
        assert!(matches!(env, Envelope::Progress { progress: 100, .. }));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = Envelope::decode(r#"{"type":"resize"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "resize"));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_non_string_result_kept_as_json_text() {
        let env =
            Envelope::decode(r#"{"type":"complete","task_id":"t","result":{"url":"/a.wav"}}"#)
                .unwrap();
        match env {
            Envelope::Complete { result, .. } => assert_eq!(result, r#"{"url":"/a.wav"}"#),
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn test_encode_uses_current_field_name() {
        let json = Envelope::complete("t1", "r1").encode().unwrap();
        assert!(json.contains(r#""type":"complete""#));
        assert!(json.contains(r#""task_id":"t1""#));
        assert!(!json.contains("taskId"));
    }

    #[test]
    fn test_status_query_is_bare() {
        let json = Envelope::status_query().encode().unwrap();
        assert_eq!(json, r#"{"type":"status"}"#);
    }

    #[test]
    fn test_deserialize_impl_matches_decode() {
        let env: Envelope = serde_json::from_str(r#"{"type":"pong","timestamp":1.5}"#).unwrap();
        assert_eq!(env, Envelope::pong(Some(1.5)));
    }
}
