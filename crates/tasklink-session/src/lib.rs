//! Client-side runtime for resilient task-progress channels.
//!
//! Provides:
//! - `Session` - Facade over one channel: connect, send, task accessors
//! - `SharedSession` - Reference-counted session shared by many callers
//! - `Lifecycle` / `LivenessMonitor` - Connection state machine and timers
//! - In-memory transport for tests and embedding

pub mod config;
mod driver;
pub mod lifecycle;
pub mod liveness;
pub mod session;
pub mod shared;
pub mod transport;

pub use config::ChannelConfig;
pub use driver::ChannelStatus;
pub use lifecycle::{ConnectionState, LifecycleError};
pub use session::{ChannelError, Session, new_task_id};
pub use shared::{SessionLease, SharedSession};
#[cfg(feature = "memory")]
pub use transport::{AcceptMode, MemoryConnector, MemoryPeer};
