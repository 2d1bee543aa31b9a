//! Session facade.
//!
//! [`Session`] is the one handle callers hold. It spawns the channel
//! driver, forwards requests to it, and serves read accessors from the
//! published connection status and the task feed without a round trip.

use std::sync::Arc;

use futures::{StreamExt, future, stream::BoxStream};
use serde_json::Value;
use tasklink_core::{
    ConnectionEvent, ConnectionEventKind, Connector, Envelope, Identity, MessageKind, SubmitError,
    Task, TaskFeed, TaskId, TaskPresenter, TaskSubmitter, TransportError,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    config::ChannelConfig,
    driver::{ChannelStatus, Command, Driver},
    lifecycle::{ConnectionState, LifecycleError},
};

/// Session-level error.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel is not connected")]
    NotConnected,
    #[error("Session has been destroyed")]
    Destroyed,
    #[error("Connect cancelled by disconnect")]
    Disconnected,
    #[error("Channel is bound to identity {0}")]
    IdentityInUse(Identity),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Submission error: {0}")]
    Submit(#[from] SubmitError),
}

/// Handle to one resilient task-progress channel.
///
/// Dropping the last handle stops the driver and closes the channel.
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ChannelStatus>,
    feed: Arc<TaskFeed>,
    home: Identity,
}

impl Session {
    /// Create a session with a freshly generated identity.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(config: ChannelConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_identity(config, connector, Identity::generate())
    }

    /// Create a session whose channel is addressed by `identity`.
    #[must_use]
    pub fn with_identity(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        identity: Identity,
    ) -> Self {
        let feed = Arc::new(TaskFeed::new());
        let (status_tx, status) = watch::channel(Driver::initial_status());
        let (commands, rx) = mpsc::unbounded_channel();
        let driver = Driver::new(
            config,
            connector,
            identity.clone(),
            Arc::clone(&feed),
            status_tx,
        );
        tokio::spawn(driver.run(rx));
        Self {
            commands,
            status,
            feed,
            home: identity,
        }
    }

    /// Identity the channel is, or will be, addressed by.
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.status
            .borrow()
            .identity
            .clone()
            .unwrap_or_else(|| self.home.clone())
    }

    /// Open the channel under the session identity.
    ///
    /// Resolves immediately when already connected. While an attempt is in
    /// flight, resolves with that attempt's outcome.
    ///
    /// # Errors
    /// Returns error if the attempt fails, is cancelled, or the session is
    /// destroyed.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.request(|reply| Command::Connect {
            identity: None,
            reply,
        })
        .await?
    }

    /// Open the channel under an explicit identity.
    ///
    /// # Errors
    /// Returns error if the channel is live under another identity, or as
    /// [`Session::connect`].
    pub async fn connect_as(&self, identity: Identity) -> Result<(), ChannelError> {
        self.request(|reply| Command::Connect {
            identity: Some(identity),
            reply,
        })
        .await?
    }

    /// Close the channel, cancel every timer and release the identity.
    pub async fn disconnect(&self) {
        let _ = self
            .request(|reply| Command::Disconnect {
                destroy: false,
                reply,
            })
            .await;
    }

    /// Close the channel for good.
    pub async fn destroy(&self) {
        let _ = self
            .request(|reply| Command::Disconnect {
                destroy: true,
                reply,
            })
            .await;
    }

    /// Send an envelope.
    ///
    /// Liveness messages are dropped silently while disconnected;
    /// application messages trigger a reconnect and fail.
    ///
    /// # Errors
    /// Returns error if the channel is not connected or the write fails.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        self.request(|reply| Command::Send { envelope, reply })
            .await?
    }

    /// Suppress (or re-enable) idle teardown while a task is running.
    ///
    /// The hold lasts until `mark_task_active(false)`.
    pub fn mark_task_active(&self, active: bool) {
        let _ = self.commands.send(Command::MarkTaskActive {
            active,
            task_id: None,
        });
    }

    /// Suppress idle teardown until `task_id` completes or fails.
    pub fn mark_task_active_for(&self, task_id: impl Into<TaskId>) {
        let _ = self.commands.send(Command::MarkTaskActive {
            active: true,
            task_id: Some(task_id.into()),
        });
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every connection status change.
    #[must_use]
    pub fn status_changes(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Most recently referenced task.
    #[must_use]
    pub fn current_task(&self) -> Option<Task> {
        self.feed.current()
    }

    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.feed.get(task_id)
    }

    /// Every task snapshot seen so far, then live ones.
    #[must_use]
    pub fn updates(&self) -> BoxStream<'static, Task> {
        self.feed.history_plus_stream()
    }

    /// Register a listener for one message type.
    pub fn on(&self, kind: MessageKind, listener: impl FnMut(&Envelope) + Send + 'static) {
        let _ = self.commands.send(Command::Listen {
            kind: Some(kind),
            listener: Box::new(listener),
        });
    }

    /// Register a listener for every message.
    pub fn on_any(&self, listener: impl FnMut(&Envelope) + Send + 'static) {
        let _ = self.commands.send(Command::Listen {
            kind: None,
            listener: Box::new(listener),
        });
    }

    /// Register a listener for connection `open`/`close`/`error` events.
    pub fn on_connection(
        &self,
        kind: Option<ConnectionEventKind>,
        listener: impl FnMut(&ConnectionEvent) + Send + 'static,
    ) {
        let _ = self.commands.send(Command::ListenConnection {
            kind,
            listener: Box::new(listener),
        });
    }

    /// Start tracking a task as `Pending` before its submission.
    ///
    /// # Errors
    /// Returns error if the driver has stopped.
    pub async fn track(&self, task_id: impl Into<TaskId>) -> Result<Task, ChannelError> {
        let task_id = task_id.into();
        self.request(|reply| Command::Track { task_id, reply })
            .await
    }

    /// Submit a job through `submitter` and return its task id.
    ///
    /// The task is tracked and marked active first, and the channel is
    /// opened if needed so progress frames have somewhere to land. A
    /// `result` in the response completes the task; a failed submission
    /// marks it as errored.
    ///
    /// # Errors
    /// Returns error if the submission itself fails.
    pub async fn submit<S>(&self, submitter: &S, payload: &Value) -> Result<TaskId, ChannelError>
    where
        S: TaskSubmitter + ?Sized,
    {
        let task_id = new_task_id();
        self.track(task_id.clone()).await?;
        self.mark_task_active_for(task_id.clone());
        if let Err(e) = self.connect().await {
            tracing::warn!(%task_id, "Submitting without a live channel: {e}");
        }

        match submitter.submit(&self.identity(), &task_id, payload).await {
            Ok(response) => {
                if let Some(result) = response.get("result").filter(|v| !v.is_null()) {
                    let result = match result {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    self.reconcile(Envelope::complete(task_id.clone(), result));
                }
                Ok(task_id)
            }
            Err(e) => {
                tracing::warn!(%task_id, "Submission failed: {e}");
                self.reconcile(Envelope::error(task_id, Some(e.to_string())));
                Err(e.into())
            }
        }
    }

    /// Resolve with the task's terminal snapshot.
    ///
    /// A task that already finished resolves immediately. Returns `None`
    /// if the feed closes first.
    pub async fn wait_for(&self, task_id: &str) -> Option<Task> {
        self.feed
            .task_stream(task_id)
            .filter(|task| future::ready(task.is_terminal()))
            .next()
            .await
    }

    /// Bind a presentation layer to task updates.
    ///
    /// Replays known snapshots, then streams live ones. The caller owns the
    /// presenter; abort the returned handle to detach it.
    pub fn attach<P>(&self, presenter: Arc<P>) -> JoinHandle<()>
    where
        P: TaskPresenter + ?Sized + 'static,
    {
        self.feed.spawn_forwarder(presenter)
    }

    fn reconcile(&self, envelope: Envelope) {
        let _ = self.commands.send(Command::Reconcile(envelope));
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ChannelError::Destroyed)?;
        rx.await.map_err(|_| ChannelError::Destroyed)
    }
}

/// Caller-side task id: `task_` plus 16 hex digits.
#[must_use]
pub fn new_task_id() -> TaskId {
    let hex = Uuid::new_v4().simple().to_string();
    format!("task_{}", &hex[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_prefixed_and_unique() {
        let a = new_task_id();
        let b = new_task_id();
        assert!(a.starts_with("task_"));
        assert_eq!(a.len(), 21);
        assert!(a[5..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
