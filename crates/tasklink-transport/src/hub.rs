//! Server-side channel hub.
//!
//! Tracks one live connection per client identity and which client each
//! task reports to. Job code calls the `send_*` helpers with a task id and
//! never needs to know which socket, if any, is listening.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tasklink_core::TaskId;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};

use crate::protocol::ServerMessage;

/// Hub error.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Client not connected: {0}")]
    NotConnected(String),
    #[error("No client registered for task: {0}")]
    UnknownTask(TaskId),
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Hub settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub heartbeat_interval_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
        }
    }
}

impl HubConfig {
    /// Read `TASKLINK_HUB_HEARTBEAT_MS`, falling back to the default.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = std::env::var("TASKLINK_HUB_HEARTBEAT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.heartbeat_interval_ms = ms;
        }
        config
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

struct Connection {
    generation: u64,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, Connection>,
    tasks: HashMap<TaskId, String>,
    next_generation: u64,
}

impl Registry {
    /// Drop a connection and every task routed to it.
    fn remove(&mut self, client_id: &str) {
        if self.connections.remove(client_id).is_some() {
            tracing::info!(client_id, "Channel client disconnected");
        }
        self.tasks.retain(|_, owner| owner != client_id);
    }
}

/// Registry of live channel connections.
#[derive(Clone)]
pub struct ChannelHub {
    registry: Arc<RwLock<Registry>>,
    config: HubConfig,
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl ChannelHub {
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a connection for `client_id`, replacing any previous one.
    ///
    /// Returns the connection generation, needed to disconnect it, and the
    /// queue of outbound frames for the socket writer.
    pub async fn connect(&self, client_id: &str) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry.write().await;
        registry.next_generation += 1;
        let generation = registry.next_generation;
        if registry
            .connections
            .insert(client_id.to_string(), Connection { generation, tx })
            .is_some()
        {
            tracing::info!(client_id, "Replacing existing channel connection");
        } else {
            tracing::info!(client_id, "Channel client connected");
        }
        (generation, rx)
    }

    /// Remove the connection if it is still the one registered under
    /// `generation`. Returns whether anything was removed.
    pub async fn disconnect(&self, client_id: &str, generation: u64) -> bool {
        let mut registry = self.registry.write().await;
        let current = registry
            .connections
            .get(client_id)
            .is_some_and(|c| c.generation == generation);
        if current {
            registry.remove(client_id);
        }
        current
    }

    /// Route `task_id`'s frames to `client_id`.
    pub async fn register_task(&self, task_id: &str, client_id: &str) {
        tracing::debug!(task_id, client_id, "Task registered");
        self.registry
            .write()
            .await
            .tasks
            .insert(task_id.to_string(), client_id.to_string());
    }

    pub async fn unregister_task(&self, task_id: &str) {
        if self.registry.write().await.tasks.remove(task_id).is_some() {
            tracing::debug!(task_id, "Task unregistered");
        }
    }

    /// Queue a frame for one client.
    ///
    /// A client whose writer has gone away is dropped from the registry.
    ///
    /// # Errors
    /// Returns error if the client is not connected or encoding fails.
    pub async fn send_message(
        &self,
        client_id: &str,
        message: &ServerMessage,
    ) -> Result<(), HubError> {
        let text = message.to_text()?;
        let (generation, delivered) = {
            let registry = self.registry.read().await;
            let Some(connection) = registry.connections.get(client_id) else {
                tracing::warn!(client_id, "Client not connected");
                return Err(HubError::NotConnected(client_id.to_string()));
            };
            (connection.generation, connection.tx.send(text).is_ok())
        };
        if delivered {
            Ok(())
        } else {
            tracing::error!(client_id, "Send failed; dropping connection");
            self.disconnect(client_id, generation).await;
            Err(HubError::NotConnected(client_id.to_string()))
        }
    }

    /// Queue a frame for whichever client owns `task_id`.
    ///
    /// # Errors
    /// Returns error if no client is registered for the task, or as
    /// [`ChannelHub::send_message`].
    pub async fn send_to_task(
        &self,
        task_id: &str,
        message: &ServerMessage,
    ) -> Result<(), HubError> {
        let client_id = self.registry.read().await.tasks.get(task_id).cloned();
        let Some(client_id) = client_id else {
            tracing::warn!(task_id, "No client registered for task");
            return Err(HubError::UnknownTask(task_id.to_string()));
        };
        self.send_message(&client_id, message).await
    }

    /// Queue a frame for every client. Returns how many received it.
    ///
    /// # Errors
    /// Returns error if encoding fails.
    pub async fn broadcast(&self, message: &ServerMessage) -> Result<usize, HubError> {
        let text = message.to_text()?;
        let (total, failed) = {
            let registry = self.registry.read().await;
            let failed: Vec<String> = registry
                .connections
                .iter()
                .filter(|(_, c)| c.tx.send(text.clone()).is_err())
                .map(|(id, _)| id.clone())
                .collect();
            (registry.connections.len(), failed)
        };
        if !failed.is_empty() {
            let mut registry = self.registry.write().await;
            for client_id in &failed {
                tracing::error!(%client_id, "Broadcast failed; dropping connection");
                registry.remove(client_id);
            }
        }
        Ok(total - failed.len())
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.registry
            .read()
            .await
            .connections
            .contains_key(client_id)
    }

    /// # Errors
    /// As [`ChannelHub::send_to_task`].
    pub async fn send_start(&self, task_id: &str) -> Result<(), HubError> {
        self.send_to_task(task_id, &ServerMessage::start(task_id))
            .await
    }

    /// # Errors
    /// As [`ChannelHub::send_to_task`].
    pub async fn send_progress(
        &self,
        task_id: &str,
        progress: f64,
        message: &str,
    ) -> Result<(), HubError> {
        self.send_to_task(task_id, &ServerMessage::progress(task_id, progress, message))
            .await
    }

    /// Send the result and stop routing the task.
    ///
    /// # Errors
    /// As [`ChannelHub::send_to_task`].
    pub async fn send_complete(&self, task_id: &str, result: &str) -> Result<(), HubError> {
        let sent = self
            .send_to_task(task_id, &ServerMessage::complete(task_id, result))
            .await;
        self.unregister_task(task_id).await;
        sent
    }

    /// Send the failure and stop routing the task.
    ///
    /// # Errors
    /// As [`ChannelHub::send_to_task`].
    pub async fn send_error(&self, task_id: &str, error: &str) -> Result<(), HubError> {
        let sent = self
            .send_to_task(task_id, &ServerMessage::task_error(task_id, error))
            .await;
        self.unregister_task(task_id).await;
        sent
    }

    /// Synchronous progress callback for job code that cannot await.
    ///
    /// Each call schedules a `send_progress` on the runtime current at
    /// creation time. Without a runtime, calls are logged and dropped.
    #[must_use]
    pub fn progress_reporter(&self, task_id: &str) -> impl Fn(f64, &str) + Send + Sync + 'static {
        let hub = self.clone();
        let task_id = task_id.to_string();
        let handle = tokio::runtime::Handle::try_current().ok();
        move |progress: f64, message: &str| {
            let Some(handle) = &handle else {
                tracing::warn!(%task_id, "No runtime to report progress on");
                return;
            };
            let hub = hub.clone();
            let task_id = task_id.clone();
            let message = message.to_string();
            handle.spawn(async move {
                if let Err(e) = hub.send_progress(&task_id, progress, &message).await {
                    tracing::debug!("Progress not delivered: {e}");
                }
            });
        }
    }
}
