//! Wire transports for task-progress channels.
//!
//! Provides:
//! - Server wire protocol and channel hub
//! - WebSocket client connector (feature: client)
//! - WebSocket server endpoint (feature: server)

pub mod hub;
pub mod protocol;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod websocket;

#[cfg(feature = "client")]
pub use client::WsConnector;
pub use hub::{ChannelHub, HubConfig, HubError};
pub use protocol::{ClientMessage, ServerMessage};
#[cfg(feature = "server")]
pub use websocket::channel_router;
