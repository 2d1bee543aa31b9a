//! Broadcast + history feed of task snapshots.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, PoisonError, RwLock},
};

use futures::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{
    TaskPresenter,
    task::{Task, TaskId},
};

/// Default number of snapshots kept for late subscribers.
const HISTORY_LEN: usize = 1024;

struct Inner {
    history: VecDeque<Task>,
    latest: HashMap<TaskId, Task>,
    current: Option<TaskId>,
}

/// Feed of task snapshots published by the reconciler.
///
/// Presentation layers subscribe here: they receive the retained history
/// first, then switch to live updates. The feed also indexes the latest
/// snapshot per task so read accessors never touch the reconciler.
pub struct TaskFeed {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<Task>,
    capacity: usize,
}

impl Default for TaskFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskFeed {
    /// Create a feed with the default history length.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_LEN)
    }

    /// Create a feed retaining at most `capacity` snapshots.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                latest: HashMap::new(),
                current: None,
            }),
            sender,
            capacity: capacity.max(1),
        }
    }

    /// Publish a snapshot to live listeners and history.
    pub fn push(&self, task: Task) {
        let _ = self.sender.send(task.clone()); // live listeners

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.history.len() >= self.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(task.clone());
        inner.current = Some(task.id.clone());
        inner.latest.insert(task.id.clone(), task);
    }

    /// Drop a task from the latest-snapshot index.
    ///
    /// History and live subscribers are unaffected.
    pub fn forget(&self, task_id: &str) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .latest
            .remove(task_id);
    }

    /// Latest snapshot of a task.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest
            .get(task_id)
            .cloned()
    }

    /// Latest snapshot of the most recently referenced task.
    #[must_use]
    pub fn current(&self) -> Option<Task> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .current
            .as_ref()
            .and_then(|id| inner.latest.get(id))
            .cloned()
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<Task> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn get_history(&self) -> Vec<Task> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live updates.
    ///
    /// Subscribes before reading history, so a snapshot published in
    /// between may appear twice; consumers apply snapshots idempotently.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, Task> {
        let rx = self.get_receiver();
        let history = self.get_history();

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            if let Err(e) = &res {
                tracing::warn!("Task feed subscriber lagged: {e}");
            }
            res.ok()
        });

        Box::pin(hist.chain(live))
    }

    /// Stream of one task's snapshots, ending with its terminal snapshot.
    ///
    /// A task that already finished yields only its terminal snapshot, even
    /// when its earlier snapshots have left the history.
    #[must_use]
    pub fn task_stream(&self, task_id: &str) -> futures::stream::BoxStream<'static, Task> {
        let stream = self.history_plus_stream();
        if let Some(task) = self.get(task_id).filter(Task::is_terminal) {
            return futures::stream::once(future::ready(task)).boxed();
        }
        let task_id = task_id.to_string();
        stream
            .filter(move |task| future::ready(task.id == task_id))
            .scan(false, |finished, task| {
                if *finished {
                    return future::ready(None);
                }
                *finished = task.is_terminal();
                future::ready(Some(task))
            })
            .boxed()
    }

    /// Forward every snapshot into a presenter until the feed closes.
    pub fn spawn_forwarder<P>(&self, presenter: Arc<P>) -> tokio::task::JoinHandle<()>
    where
        P: TaskPresenter + ?Sized + 'static,
    {
        let stream = self.history_plus_stream();
        tokio::spawn(async move {
            tokio::pin!(stream);
            while let Some(task) = stream.next().await {
                presenter.render(&task);
            }
        })
    }
}
