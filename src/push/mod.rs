//! Push channel: server-originated entity change events over the hub.
//!
//! - `protocol`: JSON hub record framing and event-name normalization
//! - `client`: connection lifecycle, handler registry, reconnect policy
//! - `ws`: negotiated WebSocket transport

mod client;
pub mod protocol;
mod ws;

pub use client::{
    ConnectionState, EventHandler, HubConnector, HubLink, PushClient, PushConfig, PushError,
};
pub use protocol::{normalize_event_name, HubMessage, HubProtocol, ProtocolError, RECORD_SEPARATOR};
pub use ws::WsConnector;
