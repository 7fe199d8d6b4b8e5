//! TaskSync - client-side mirror of a task server.
//!
//! Keeps items and categories in sync through two channels:
//! - request/response commands against the REST API (`api`)
//! - server-pushed entity change events over the hub (`push`, `sync`)
//!
//! Both channels feed the same idempotent store apply-functions (`store`), so
//! the mirror converges regardless of which one reports a change first.

pub mod api;
pub mod client;
pub mod config;
pub mod model;
pub mod push;
pub mod session;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use api::{CommandError, Commands, HttpExecutor, RequestExecutor};
pub use client::{ClientError, TaskSyncClient};
pub use config::{ClientConfig, ConfigError};
pub use model::{
    Category, CategoryId, CategoryPayload, Credentials, Item, ItemFilter, ItemId, ItemPayload,
    Priority, Registration,
};
pub use push::{ConnectionState, HubConnector, PushClient, PushConfig, PushError, WsConnector};
pub use session::{Credential, SessionHolder};
pub use store::{EntityStore, SharedStore, StoreChange, StoreUpdate};
pub use sync::{EventKind, SyncCoordinator};
