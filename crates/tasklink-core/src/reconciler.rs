//! Task reconciliation.
//!
//! Maps an unordered, possibly duplicated, possibly incomplete stream of
//! task envelopes onto canonical [`Task`] records. Every message type
//! creates its task on demand, so a `start` lost across a reconnect never
//! orphans the `progress`/`complete` frames that follow it. Terminal
//! states stick: later frames are accepted but never move the status.
//!
//! Finished tasks are retained up to a bound; the oldest are forgotten
//! first. Unfinished tasks and the current task are never evicted.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use crate::{
    envelope::Envelope,
    task::{Task, TaskId, TaskStatus},
    task_feed::TaskFeed,
};

/// Finished tasks kept by default.
const FINISHED_RETENTION: usize = 256;

/// Owner of the task map.
pub struct Reconciler {
    tasks: HashMap<TaskId, Task>,
    current: Option<TaskId>,
    feed: Option<Arc<TaskFeed>>,
    /// Finished task ids, oldest first.
    finished: VecDeque<TaskId>,
    retention: usize,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            tasks: HashMap::new(),
            current: None,
            feed: None,
            finished: VecDeque::new(),
            retention: FINISHED_RETENTION,
        }
    }
}

impl Reconciler {
    /// Create a reconciler with no output feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a reconciler that publishes every change to `feed`.
    #[must_use]
    pub fn with_feed(feed: Arc<TaskFeed>) -> Self {
        Self {
            feed: Some(feed),
            ..Self::default()
        }
    }

    /// Keep at most `retention` finished tasks.
    #[must_use]
    pub const fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    /// Return the task, creating it as `Processing` if absent.
    ///
    /// This is the single creation path for channel traffic.
    pub fn upsert(&mut self, task_id: &str) -> &mut Task {
        self.current = Some(task_id.to_string());
        self.tasks.entry(task_id.to_string()).or_insert_with(|| {
            tracing::debug!(task_id, "Creating task on first reference");
            Task::new(task_id, TaskStatus::Processing)
        })
    }

    /// Register a task the local side is about to submit.
    ///
    /// Creates it as `Pending`; an existing record is left alone.
    pub fn track(&mut self, task_id: &str) -> Task {
        self.current = Some(task_id.to_string());
        let task = self
            .tasks
            .entry(task_id.to_string())
            .or_insert_with(|| Task::new(task_id, TaskStatus::Pending))
            .clone();
        self.publish(&task);
        task
    }

    /// Apply one envelope.
    ///
    /// Returns the updated snapshot, or `None` for envelopes that carry no
    /// task (liveness, greeting, status).
    pub fn apply(&mut self, envelope: &Envelope) -> Option<Task> {
        let was_terminal = envelope
            .task_id()
            .and_then(|id| self.tasks.get(id))
            .is_some_and(Task::is_terminal);
        let snapshot = match envelope {
            Envelope::Start {
                task_id, message, ..
            } => {
                let task = self.upsert(task_id);
                if !task.is_terminal() {
                    promote(task);
                    if let Some(message) = message {
                        task.message.clone_from(message);
                    }
                }
                task.touch();
                task.clone()
            }
            Envelope::Progress {
                task_id,
                progress,
                message,
                ..
            } => {
                let task = self.upsert(task_id);
                if task.is_terminal() {
                    tracing::debug!(%task_id, "Ignoring progress for finished task");
                } else {
                    promote(task);
                    task.progress = *progress;
                    if let Some(message) = message {
                        task.message.clone_from(message);
                    }
                }
                task.touch();
                task.clone()
            }
            Envelope::Complete {
                task_id,
                result,
                message,
                ..
            } => {
                let task = self.upsert(task_id);
                if !task.is_terminal() {
                    task.status = TaskStatus::Completed;
                    task.progress = 100;
                    task.result = Some(result.clone());
                    if let Some(message) = message {
                        task.message.clone_from(message);
                    }
                }
                task.touch();
                task.clone()
            }
            Envelope::Error {
                task_id,
                error,
                message,
                ..
            } => {
                let task = self.upsert(task_id);
                if !task.is_terminal() {
                    task.status = TaskStatus::Error;
                    task.error = error.clone().or_else(|| message.clone());
                    if let Some(message) = message {
                        task.message.clone_from(message);
                    }
                }
                task.touch();
                task.clone()
            }
            Envelope::Ping { .. }
            | Envelope::Pong { .. }
            | Envelope::Connected { .. }
            | Envelope::Status { .. } => return None,
        };
        self.publish(&snapshot);
        if snapshot.is_terminal() && !was_terminal {
            self.retire(&snapshot.id);
        }
        Some(snapshot)
    }

    /// Task by id.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// Most recently referenced task.
    #[must_use]
    pub fn current(&self) -> Option<&Task> {
        self.current.as_ref().and_then(|id| self.tasks.get(id))
    }

    /// Number of tracked tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task has been seen yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Record a newly finished task and evict the oldest beyond the bound.
    fn retire(&mut self, task_id: &str) {
        self.finished.push_back(task_id.to_string());
        while self.finished.len() > self.retention {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            if self.current.as_deref() == Some(oldest.as_str()) {
                self.finished.push_front(oldest);
                break;
            }
            tracing::trace!(task_id = %oldest, "Forgetting finished task");
            self.tasks.remove(&oldest);
            if let Some(feed) = &self.feed {
                feed.forget(&oldest);
            }
        }
    }

    fn publish(&self, task: &Task) {
        if let Some(feed) = &self.feed {
            feed.push(task.clone());
        }
    }
}

fn promote(task: &mut Task) {
    if task.status == TaskStatus::Pending {
        task.status = TaskStatus::Processing;
    }
}
