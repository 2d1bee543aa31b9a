//! In-memory transport.
//!
//! Useful for tests and single-process embedding. Each accepted connection
//! yields a [`MemoryPeer`] playing the server side.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use tasklink_core::{Connector, Envelope, Identity, Link, TransportError};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

/// How the connector answers the next attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptMode {
    #[default]
    Accept,
    /// Fail immediately.
    Refuse,
    /// Never complete; the caller's connect timeout decides.
    Hang,
}

struct State {
    mode: Mutex<AcceptMode>,
    attempts: AtomicUsize,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: AsyncMutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

/// Scripted connector. Clones share state.
#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<State>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(State {
                mode: Mutex::new(AcceptMode::Accept),
                attempts: AtomicUsize::new(0),
                peers_tx,
                peers_rx: AsyncMutex::new(peers_rx),
            }),
        }
    }

    pub fn set_mode(&self, mode: AcceptMode) {
        *self
            .state
            .mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = mode;
    }

    fn mode(&self) -> AcceptMode {
        *self
            .state
            .mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Physical connect attempts so far, whatever their outcome.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next accepted connection.
    pub async fn next_peer(&self) -> Option<MemoryPeer> {
        self.state.peers_rx.lock().await.recv().await
    }

    /// Next accepted connection, if one is already waiting.
    pub fn try_next_peer(&self) -> Option<MemoryPeer> {
        self.state.peers_rx.try_lock().ok()?.try_recv().ok()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, identity: &Identity) -> Result<Link, TransportError> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        match self.mode() {
            AcceptMode::Refuse => {
                return Err(TransportError::Connect("connection refused".to_string()));
            }
            AcceptMode::Hang => return std::future::pending().await,
            AcceptMode::Accept => {}
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            identity: identity.clone(),
            to_client: Some(in_tx),
            from_client: out_rx,
        };
        self.state
            .peers_tx
            .send(peer)
            .map_err(|_| TransportError::Connect("connector shut down".to_string()))?;
        Ok(Link::new(out_tx, in_rx))
    }
}

/// Server side of one in-memory connection.
pub struct MemoryPeer {
    identity: Identity,
    to_client: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Identity the client connected with.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Deliver a raw text frame. Returns `false` if the client is gone.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        self.to_client
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(frame.into())).is_ok())
    }

    /// Deliver an encoded envelope.
    pub fn push_envelope(&self, envelope: &Envelope) -> bool {
        envelope.encode().is_ok_and(|text| self.push(text))
    }

    /// Surface a transport error on the client's read side.
    pub fn fail(&self, error: TransportError) -> bool {
        self.to_client
            .as_ref()
            .is_some_and(|tx| tx.send(Err(error)).is_ok())
    }

    /// Close from the server side.
    pub fn close(&mut self) {
        self.to_client = None;
    }

    /// Next frame written by the client; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame written by the client, decoded.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        let text = self.recv().await?;
        Envelope::decode(&text).ok()
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }

    /// Whether the client dropped its side of the link.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.to_client.as_ref().is_none_or(mpsc::UnboundedSender::is_closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accepted_connection_pairs_with_peer() {
        let connector = MemoryConnector::new();
        let mut link = connector.connect(&Identity::new("c1")).await.unwrap();
        let mut peer = connector.next_peer().await.unwrap();
        assert_eq!(peer.identity().as_str(), "c1");

        link.send("up".into()).unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("up"));

        assert!(peer.push("down"));
        assert_eq!(link.recv().await, Some(Ok("down".to_string())));

        peer.close();
        assert_eq!(link.recv().await, None);
    }

    #[tokio::test]
    async fn test_refuse_counts_attempts() {
        let connector = MemoryConnector::new();
        connector.set_mode(AcceptMode::Refuse);
        for _ in 0..3 {
            assert!(connector.connect(&Identity::new("c")).await.is_err());
        }
        assert_eq!(connector.attempts(), 3);
        assert!(connector.try_next_peer().is_none());
    }

    #[tokio::test]
    async fn test_dropping_link_is_visible_to_peer() {
        let connector = MemoryConnector::new();
        let link = connector.connect(&Identity::new("c")).await.unwrap();
        let mut peer = connector.try_next_peer().unwrap();
        assert!(!peer.is_closed());
        drop(link);
        assert!(peer.is_closed());
        assert_eq!(peer.recv().await, None);
    }
}
