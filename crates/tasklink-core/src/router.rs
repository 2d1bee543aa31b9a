//! Envelope decoding and per-type listener dispatch.
//!
//! The router holds no channel state. It turns inbound text frames into
//! [`Envelope`]s, hands them to listeners registered for their type, and
//! keeps a second registry for connection-level events, which are not part
//! of the message vocabulary.

use std::fmt;

use crate::{
    Identity,
    envelope::{Envelope, MessageKind},
};

/// Listener for decoded envelopes.
pub type EnvelopeListener = Box<dyn FnMut(&Envelope) + Send>;

/// Listener for connection-level events.
pub type ConnectionListener = Box<dyn FnMut(&ConnectionEvent) + Send>;

/// Why a physical connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by `disconnect()`.
    Local,
    /// The peer closed the connection or the stream ended.
    Remote,
    /// No inbound traffic within the staleness threshold.
    Stale,
    /// Closed by the idle-retention policy.
    Idle,
    /// The transport reported an error.
    Transport(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("closed locally"),
            Self::Remote => f.write_str("closed by peer"),
            Self::Stale => f.write_str("connection went stale"),
            Self::Idle => f.write_str("idle timeout"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Connection-level event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A physical connection opened.
    Open { identity: Identity },
    /// A physical connection closed. Fired exactly once per connection.
    Close { reason: CloseReason },
    /// A connect attempt or the open connection failed.
    Error { message: String },
}

/// Connection event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    Open,
    Close,
    Error,
}

impl ConnectionEvent {
    /// Event type.
    #[must_use]
    pub const fn kind(&self) -> ConnectionEventKind {
        match self {
            Self::Open { .. } => ConnectionEventKind::Open,
            Self::Close { .. } => ConnectionEventKind::Close,
            Self::Error { .. } => ConnectionEventKind::Error,
        }
    }
}

/// Typed message router.
///
/// Listeners run synchronously, in registration order, on whatever task
/// calls [`Router::dispatch`]. A listener registered without a type sees
/// every envelope.
#[derive(Default)]
pub struct Router {
    listeners: Vec<(Option<MessageKind>, EnvelopeListener)>,
    connection_listeners: Vec<(Option<ConnectionEventKind>, ConnectionListener)>,
    dropped: u64,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one message type.
    pub fn on(&mut self, kind: MessageKind, listener: impl FnMut(&Envelope) + Send + 'static) {
        self.listeners.push((Some(kind), Box::new(listener)));
    }

    /// Register a listener for every message type.
    pub fn on_any(&mut self, listener: impl FnMut(&Envelope) + Send + 'static) {
        self.listeners.push((None, Box::new(listener)));
    }

    /// Register a listener, optionally filtered by type.
    pub fn subscribe(&mut self, kind: Option<MessageKind>, listener: EnvelopeListener) {
        self.listeners.push((kind, listener));
    }

    /// Register a listener for one connection event type.
    pub fn on_connection(
        &mut self,
        kind: ConnectionEventKind,
        listener: impl FnMut(&ConnectionEvent) + Send + 'static,
    ) {
        self.connection_listeners
            .push((Some(kind), Box::new(listener)));
    }

    /// Register a connection listener, optionally filtered by type.
    pub fn subscribe_connection(
        &mut self,
        kind: Option<ConnectionEventKind>,
        listener: ConnectionListener,
    ) {
        self.connection_listeners.push((kind, listener));
    }

    /// Decode a text frame.
    ///
    /// Failures are logged and counted, never returned: one bad frame must
    /// not disturb the frames after it.
    pub fn decode(&mut self, frame: &str) -> Option<Envelope> {
        match Envelope::decode(frame) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                self.dropped += 1;
                tracing::warn!("Dropping inbound frame: {e}");
                tracing::trace!(frame, "Dropped frame body");
                None
            }
        }
    }

    /// Invoke every listener registered for the envelope's type.
    pub fn dispatch(&mut self, envelope: &Envelope) {
        let kind = envelope.kind();
        for (filter, listener) in &mut self.listeners {
            if filter.is_none_or(|k| k == kind) {
                listener(envelope);
            }
        }
    }

    /// Decode and dispatch in one step. Returns the message type on success.
    pub fn route(&mut self, frame: &str) -> Option<MessageKind> {
        let envelope = self.decode(frame)?;
        self.dispatch(&envelope);
        Some(envelope.kind())
    }

    /// Invoke every connection listener registered for the event's type.
    pub fn emit(&mut self, event: &ConnectionEvent) {
        let kind = event.kind();
        for (filter, listener) in &mut self.connection_listeners {
            if filter.is_none_or(|k| k == kind) {
                listener(event);
            }
        }
    }

    /// Number of inbound frames dropped as undecodable.
    #[must_use]
    pub const fn dropped_frames(&self) -> u64 {
        self.dropped
    }
}
