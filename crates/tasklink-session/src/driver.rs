//! The channel event loop.
//!
//! One task owns every piece of channel state: the lifecycle record, the
//! liveness deadlines, the router and the reconciler. Callers talk to it
//! through [`Command`]s; nothing else mutates that state, so timers and
//! inbound frames never overlap.

use std::{future, sync::Arc};

use futures::future::BoxFuture;
use tasklink_core::{
    CloseReason, ConnectionEvent, ConnectionEventKind, Connector, Envelope, Identity, Link,
    MessageKind, Reconciler, Router, Task, TaskFeed, TaskId, TransportError,
    router::{ConnectionListener, EnvelopeListener},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};

use crate::{
    config::ChannelConfig,
    lifecycle::{Admission, ConnectionState, Lifecycle},
    liveness::{LivenessAction, LivenessMonitor},
    session::ChannelError,
};

type Reply<T> = oneshot::Sender<T>;

/// Request to the event loop.
pub(crate) enum Command {
    Connect {
        identity: Option<Identity>,
        reply: Reply<Result<(), ChannelError>>,
    },
    Disconnect {
        destroy: bool,
        reply: Reply<()>,
    },
    Send {
        envelope: Envelope,
        reply: Reply<Result<(), ChannelError>>,
    },
    /// Hold or release idle teardown. With a task id, the hold also ends
    /// when that task finishes.
    MarkTaskActive {
        active: bool,
        task_id: Option<TaskId>,
    },
    Listen {
        kind: Option<MessageKind>,
        listener: EnvelopeListener,
    },
    ListenConnection {
        kind: Option<ConnectionEventKind>,
        listener: ConnectionListener,
    },
    Track {
        task_id: TaskId,
        reply: Reply<Task>,
    },
    /// Feed a locally produced task message through the reconciler only.
    Reconcile(Envelope),
}

/// Published connection snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ConnectionState,
    pub identity: Option<Identity>,
    /// Reconnect attempts since the last successful connect.
    pub attempt: u32,
}

pub(crate) struct Driver {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    home: Identity,
    lifecycle: Lifecycle,
    liveness: LivenessMonitor,
    router: Router,
    reconciler: Reconciler,
    link: Option<Link>,
    attempt: Option<BoxFuture<'static, Result<Link, TransportError>>>,
    deferred_until: Option<Instant>,
    reconnect_at: Option<Instant>,
    /// Task whose completion releases the idle hold.
    active_task: Option<TaskId>,
    waiters: Vec<Reply<Result<(), ChannelError>>>,
    status: watch::Sender<ChannelStatus>,
}

impl Driver {
    pub(crate) fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        home: Identity,
        feed: Arc<TaskFeed>,
        status: watch::Sender<ChannelStatus>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new(&config),
            liveness: LivenessMonitor::new(&config),
            config,
            connector,
            home,
            router: Router::new(),
            reconciler: Reconciler::with_feed(feed),
            link: None,
            attempt: None,
            deferred_until: None,
            reconnect_at: None,
            active_task: None,
            waiters: Vec::new(),
            status,
        }
    }

    pub(crate) const fn initial_status() -> ChannelStatus {
        ChannelStatus {
            state: ConnectionState::Disconnected,
            identity: None,
            attempt: 0,
        }
    }

    /// Run until every command sender is gone.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let liveness_at = self.liveness.next_deadline();
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                frame = recv_frame(&mut self.link) => self.handle_frame(frame),
                result = poll_attempt(&mut self.attempt) => self.attempt_finished(result),
                () = sleep_until(self.deferred_until) => {
                    self.deferred_until = None;
                    self.launch_attempt();
                }
                () = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_attempt();
                }
                () = sleep_until(liveness_at) => self.poll_liveness(),
            }
        }
        self.teardown(true);
        tracing::debug!("Channel driver stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { identity, reply } => self.connect(identity, reply),
            Command::Disconnect { destroy, reply } => {
                self.teardown(destroy);
                let _ = reply.send(());
            }
            Command::Send { envelope, reply } => {
                let _ = reply.send(self.send(&envelope));
            }
            Command::MarkTaskActive { active, task_id } => {
                self.active_task = task_id.filter(|_| active);
                self.liveness.set_task_active(active, Instant::now());
            }
            Command::Listen { kind, listener } => self.router.subscribe(kind, listener),
            Command::ListenConnection { kind, listener } => {
                self.router.subscribe_connection(kind, listener);
            }
            Command::Track { task_id, reply } => {
                let _ = reply.send(self.reconciler.track(&task_id));
            }
            Command::Reconcile(envelope) => self.reconcile(&envelope),
        }
    }

    fn connect(&mut self, identity: Option<Identity>, reply: Reply<Result<(), ChannelError>>) {
        let state = self.lifecycle.state();
        if state == ConnectionState::Destroyed {
            let _ = reply.send(Err(ChannelError::Destroyed));
            return;
        }

        let bound = self.lifecycle.identity().cloned();
        let identity = identity
            .or_else(|| bound.clone())
            .unwrap_or_else(|| self.home.clone());
        if matches!(
            state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            if let Some(bound) = bound.filter(|b| *b != identity) {
                let _ = reply.send(Err(ChannelError::IdentityInUse(bound)));
                return;
            }
        }

        match state {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => self.waiters.push(reply),
            ConnectionState::Disconnected | ConnectionState::ReconnectScheduled => {
                if let Err(e) = self.lifecycle.bind(identity) {
                    let _ = reply.send(Err(e.into()));
                    return;
                }
                self.waiters.push(reply);
                self.start_attempt();
            }
            ConnectionState::Destroyed => {}
        }
    }

    /// Start an attempt now, or defer it until the cooldown has passed.
    fn start_attempt(&mut self) {
        self.reconnect_at = None;
        if self.attempt.is_some() || self.deferred_until.is_some() {
            return;
        }
        if self.lifecycle.identity().is_none() && self.lifecycle.bind(self.home.clone()).is_err() {
            return;
        }
        match self.lifecycle.admit(Instant::now()) {
            Admission::Now => self.launch_attempt(),
            Admission::DeferUntil(at) => {
                if let Err(e) = self.lifecycle.transition(ConnectionState::Connecting) {
                    tracing::warn!("Cannot defer connect: {e}");
                    return;
                }
                tracing::debug!("Connect deferred by cooldown");
                self.deferred_until = Some(at);
                self.publish();
            }
        }
    }

    fn launch_attempt(&mut self) {
        let Some(identity) = self.lifecycle.identity().cloned() else {
            return;
        };
        if let Err(e) = self.lifecycle.begin_attempt(Instant::now()) {
            tracing::warn!("Cannot start connect attempt: {e}");
            return;
        }
        tracing::debug!(%identity, "Opening channel");

        let connector = Arc::clone(&self.connector);
        let timeout = self.config.connect_timeout();
        self.attempt = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, connector.connect(&identity)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            }
        }));
        self.publish();
    }

    fn attempt_finished(&mut self, result: Result<Link, TransportError>) {
        self.attempt = None;
        let now = Instant::now();
        match result {
            Ok(link) => {
                if let Err(e) = self.lifecycle.attempt_succeeded(now) {
                    tracing::warn!("Discarding connection: {e}");
                    return;
                }
                self.link = Some(link);
                self.liveness.start(now);
                let identity = self
                    .lifecycle
                    .identity()
                    .cloned()
                    .unwrap_or_else(|| self.home.clone());
                tracing::info!(%identity, "Channel connected");
                self.publish();
                self.router.emit(&ConnectionEvent::Open { identity });
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => {
                tracing::warn!("Connect attempt failed: {e}");
                self.schedule_reconnect();
                self.publish();
                self.router.emit(&ConnectionEvent::Error {
                    message: e.to_string(),
                });
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Err(ChannelError::Transport(e.clone())));
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Option<Result<String, TransportError>>) {
        match frame {
            Some(Ok(text)) => self.handle_text(&text),
            Some(Err(e)) => {
                tracing::warn!("Channel transport error: {e}");
                self.router.emit(&ConnectionEvent::Error {
                    message: e.to_string(),
                });
                self.connection_lost(CloseReason::Transport(e.to_string()));
            }
            None => self.connection_lost(CloseReason::Remote),
        }
    }

    fn handle_text(&mut self, text: &str) {
        let now = Instant::now();
        let Some(envelope) = self.router.decode(text) else {
            self.liveness.record_inbound(now, false);
            return;
        };

        let application = !envelope.is_liveness();
        self.liveness.record_inbound(now, application);
        if application {
            self.lifecycle.touch(now);
        }

        match &envelope {
            Envelope::Ping { timestamp } => {
                tracing::trace!("Answering server ping");
                if let Err(e) = self.send(&Envelope::pong(*timestamp)) {
                    tracing::debug!("Pong not sent: {e}");
                }
            }
            Envelope::Pong { .. } => tracing::trace!("Heartbeat acknowledged"),
            _ => {}
        }

        self.reconcile(&envelope);
        self.router.dispatch(&envelope);
    }

    /// Apply a task message. Finishing the held task releases the idle hold;
    /// other tasks, and repeats of an already finished one, leave it alone.
    fn reconcile(&mut self, envelope: &Envelope) {
        let finishes_held = envelope.is_terminal()
            && envelope.task_id().is_some_and(|id| {
                self.active_task.as_deref() == Some(id)
                    && !self.reconciler.get(id).is_some_and(Task::is_terminal)
            });
        if self.reconciler.apply(envelope).is_some() && finishes_held {
            self.active_task = None;
            self.liveness.set_task_active(false, Instant::now());
        }
    }

    fn send(&mut self, envelope: &Envelope) -> Result<(), ChannelError> {
        match self.lifecycle.state() {
            ConnectionState::Destroyed => return Err(ChannelError::Destroyed),
            ConnectionState::Connected => {}
            _ if envelope.is_liveness() => {
                tracing::trace!("Dropping {} while not connected", envelope.kind());
                return Ok(());
            }
            _ => {
                tracing::debug!("Send while not connected; reconnecting");
                self.start_attempt();
                return Err(ChannelError::NotConnected);
            }
        }

        let Some(link) = &self.link else {
            return Err(ChannelError::NotConnected);
        };
        let text = envelope
            .encode()
            .map_err(|e| ChannelError::Encode(e.to_string()))?;
        link.send(text)?;
        if !envelope.is_liveness() {
            self.liveness.record_activity(Instant::now());
        }
        Ok(())
    }

    fn poll_liveness(&mut self) {
        for action in self.liveness.poll(Instant::now()) {
            match action {
                LivenessAction::Stale => {
                    tracing::warn!(
                        "No inbound traffic for {:?}; closing channel",
                        self.config.stale_threshold()
                    );
                    self.connection_lost(CloseReason::Stale);
                    return;
                }
                LivenessAction::Idle => {
                    tracing::info!("Channel idle; closing until next demand");
                    self.liveness.stop();
                    self.close_link(CloseReason::Idle);
                    self.lifecycle.settle();
                    self.publish();
                    return;
                }
                LivenessAction::Heartbeat => {
                    tracing::trace!("Sending heartbeat");
                    if let Err(e) = self.send(&Envelope::ping()) {
                        tracing::debug!("Heartbeat not sent: {e}");
                    }
                }
            }
        }
    }

    /// Handle a close the local side did not ask for.
    fn connection_lost(&mut self, reason: CloseReason) {
        self.liveness.stop();
        self.close_link(reason);
        self.schedule_reconnect();
        self.publish();
    }

    /// Drop the link and fire its close event. A link is taken at most
    /// once, so each physical connection reports exactly one close.
    fn close_link(&mut self, reason: CloseReason) {
        if let Some(link) = self.link.take() {
            drop(link);
            tracing::info!("Channel closed: {reason}");
            self.router.emit(&ConnectionEvent::Close { reason });
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.lifecycle.schedule_reconnect() {
            Some(delay) => {
                tracing::info!(
                    "Reconnecting in {delay:?} (attempt {})",
                    self.lifecycle.attempt()
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => self.reconnect_at = None,
        }
    }

    /// Cancel every timer and the in-flight attempt, then close.
    fn teardown(&mut self, destroy: bool) {
        self.reconnect_at = None;
        self.deferred_until = None;
        self.attempt = None;
        self.liveness.stop();
        self.close_link(CloseReason::Local);
        self.lifecycle.release(destroy);
        self.publish();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(ChannelError::Disconnected));
        }
    }

    fn publish(&self) {
        let next = ChannelStatus {
            state: self.lifecycle.state(),
            identity: self.lifecycle.identity().cloned(),
            attempt: self.lifecycle.attempt(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn recv_frame(link: &mut Option<Link>) -> Option<Result<String, TransportError>> {
    match link {
        Some(link) => link.recv().await,
        None => future::pending().await,
    }
}

async fn poll_attempt(
    attempt: &mut Option<BoxFuture<'static, Result<Link, TransportError>>>,
) -> Result<Link, TransportError> {
    match attempt {
        Some(attempt) => attempt.await,
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => future::pending().await,
    }
}
