//! Connector implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::{AcceptMode, MemoryConnector, MemoryPeer};
