//! Core building blocks for resilient task-progress channels.
//!
//! This crate provides the transport-agnostic pieces:
//! - `Envelope` - Typed wire messages with legacy field normalization
//! - `Router` - Per-type listener dispatch and connection events
//! - `Reconciler` - Canonical task records from unordered messages
//! - `TaskFeed` - Broadcast + history of task snapshots
//! - Transport, submission and presentation traits

pub mod envelope;
pub mod identity;
pub mod reconciler;
pub mod router;
pub mod task;
pub mod task_feed;
pub mod traits;

pub use envelope::{Envelope, MessageKind, ProtocolError};
pub use identity::Identity;
pub use reconciler::Reconciler;
pub use router::{CloseReason, ConnectionEvent, ConnectionEventKind, Router};
pub use task::{Task, TaskId, TaskStatus};
pub use task_feed::TaskFeed;
pub use traits::{Connector, Link, SubmitError, TaskPresenter, TaskSubmitter, TransportError};
