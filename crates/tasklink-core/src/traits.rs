//! Collaborator traits: transport, job submission, presentation.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::mpsc, task::AbortHandle};

use crate::{Identity, Task, TaskId};

/// Transport error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Connect timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Connection closed")]
    Closed,
    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// One open physical connection.
///
/// Transports pump frames through a pair of channels: text pushed into
/// `send` is written to the peer, and every frame read from the peer
/// arrives on `recv`. `recv` returning `None` means the peer side is gone.
/// Dropping the link closes the write side and stops the read pump.
pub struct Link {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    reader: Option<AbortHandle>,
}

impl Link {
    /// Assemble a link from its frame channels.
    #[must_use]
    pub const fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            reader: None,
        }
    }

    /// Abort `reader` when this link is dropped.
    #[must_use]
    pub fn with_reader(mut self, reader: AbortHandle) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Queue a text frame for the peer.
    ///
    /// # Errors
    /// Returns error if the write side has already shut down.
    pub fn send(&self, text: String) -> Result<(), TransportError> {
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    /// Next inbound frame; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Opens physical connections for a channel identity.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection addressed by `identity`.
    async fn connect(&self, identity: &Identity) -> Result<Link, TransportError>;
}

/// Submission error.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Submission rejected: {0}")]
    Rejected(String),
    #[error("Submission failed: {0}")]
    Failed(String),
}

/// The one-shot call that starts a generation job.
///
/// Implementations must cause the server to emit `start`/`progress`/
/// `complete`/`error` frames correlated by `task_id` on the channel named by
/// `identity`. The returned value is the call's response body; a string
/// `result` field in it is treated as the completed result.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    /// Submit a job.
    async fn submit(
        &self,
        identity: &Identity,
        task_id: &TaskId,
        payload: &Value,
    ) -> Result<Value, SubmitError>;
}

/// External presentation layer bound to task updates.
pub trait TaskPresenter: Send + Sync {
    /// Render one task snapshot.
    fn render(&self, task: &Task);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_round_trips_frames() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let mut link = Link::new(out_tx, in_rx);

        link.send("hello".into()).unwrap();
        assert_eq!(out_rx.recv().await.as_deref(), Some("hello"));

        in_tx.send(Ok("world".into())).unwrap();
        assert_eq!(link.recv().await, Some(Ok("world".into())));

        drop(in_tx);
        assert_eq!(link.recv().await, None);
    }

    #[test]
    fn test_send_after_peer_gone_is_closed() {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (_in_tx, in_rx) = mpsc::unbounded_channel();
        let link = Link::new(out_tx, in_rx);
        drop(out_rx);
        assert_eq!(link.send("x".into()), Err(TransportError::Closed));
    }
}
