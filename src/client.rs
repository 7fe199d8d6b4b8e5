//! Top-level client wiring.
//!
//! Bundles the store, the session, the command layer and the sync coordinator
//! so an application holds a single handle.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::{CommandError, Commands, HttpExecutor, RequestExecutor, TransportError};
use crate::config::ClientConfig;
use crate::model::ItemFilter;
use crate::push::{HubConnector, PushError, WsConnector};
use crate::session::SessionHolder;
use crate::store::SharedStore;
use crate::sync::SyncCoordinator;

/// Errors raised while building a client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Hub setup failed: {0}")]
    Push(#[from] PushError),
}

/// Shared client state
pub struct TaskSyncClient {
    store: SharedStore,
    session: SessionHolder,
    commands: Commands,
    coordinator: Arc<SyncCoordinator>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSyncClient {
    /// Client talking HTTP and WebSocket to the configured server
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let executor = HttpExecutor::new(&config.api_base_url, config.request_timeout)?;
        let connector = WsConnector::new(
            &config.hub_url,
            config.request_timeout,
            config.skip_negotiation,
        )?;
        Ok(Self::with_transports(
            config,
            Arc::new(executor),
            Arc::new(connector),
        ))
    }

    /// Client over caller-supplied transports
    pub fn with_transports(
        config: &ClientConfig,
        executor: Arc<dyn RequestExecutor>,
        connector: Arc<dyn HubConnector>,
    ) -> Self {
        let store = SharedStore::new();
        let session = SessionHolder::new();
        let commands = Commands::new(executor, session.clone(), store.clone());
        let coordinator = Arc::new(SyncCoordinator::new(
            connector,
            config.push_config(),
            store.clone(),
        ));

        Self {
            store,
            session,
            commands,
            coordinator,
            sync_task: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn session(&self) -> &SessionHolder {
        &self.session
    }

    pub fn commands(&self) -> &Commands {
        &self.commands
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Reload categories and items from the server
    pub async fn rehydrate(&self) -> Result<(), CommandError> {
        let categories = self.commands.fetch_categories().await?;
        let items = self.commands.fetch_items(&ItemFilter::default()).await?;
        info!(
            "Loaded {} categories and {} items",
            categories.len(),
            items.len()
        );
        Ok(())
    }

    /// Start following the session with the push channel. Idempotent.
    pub fn start_sync(&self) {
        let mut task = self.sync_task.lock();
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            debug!("Sync already running");
            return;
        }
        *task = Some(self.coordinator.spawn(self.session.watch()));
    }

    /// Stop following the session and close the push channel
    pub async fn shutdown(&self) {
        let task = self.sync_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.coordinator.unbind().await;
        info!("Client shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Credentials, ItemId};
    use crate::push::ConnectionState;
    use crate::testing::{MemoryConnector, MockExecutor};
    use serde_json::json;
    use std::time::Duration;

    async fn wait_for(client: &TaskSyncClient, state: ConnectionState) {
        for _ in 0..200 {
            if client.coordinator().state().await == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("never reached {:?}", state);
    }

    #[tokio::test]
    async fn test_login_starts_push_and_logout_stops_it() {
        let executor = Arc::new(MockExecutor::new());
        let (connector, mut servers) = MemoryConnector::new();
        let client =
            TaskSyncClient::with_transports(&ClientConfig::default(), executor.clone(), connector.clone());
        client.start_sync();

        executor.respond(200, json!({ "success": true, "data": "jwt" }));
        executor.respond(200, json!({ "data": [] }));
        executor.respond(200, json!({ "data": [{ "id": 1, "name": "a", "priority": 2 }] }));

        client
            .commands()
            .login(&Credentials {
                email: "user@example.com".to_string(),
                password: "secret".to_string(),
            })
            .await
            .unwrap();
        client.rehydrate().await.unwrap();
        assert!(client.store().item(ItemId(1)).is_some());

        let _server = servers.recv().await.unwrap();
        wait_for(&client, ConnectionState::Connected).await;
        assert_eq!(connector.tokens(), vec!["jwt".to_string()]);

        client.commands().logout();
        wait_for(&client, ConnectionState::Disconnected).await;
        assert!(client.coordinator().bound_events().await.is_empty());

        client.shutdown().await;
    }
}
