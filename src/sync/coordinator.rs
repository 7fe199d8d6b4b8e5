//! Binds push events to the store for the lifetime of a session.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{route, EventKind};
use crate::push::{ConnectionState, HubConnector, PushClient, PushConfig, PushError};
use crate::session::Credential;
use crate::store::{SharedStore, StoreUpdate};

/// The push client bound to one credential
struct ActiveSession {
    credential: Credential,
    client: Arc<PushClient>,
}

/// Follows the session: on acquisition a fresh push client is created, one
/// handler per [`EventKind`] is bound and the connection is started; on loss
/// every handler is unbound and the connection is stopped. The mirror is
/// emptied whenever the credential it was loaded under goes away.
pub struct SyncCoordinator {
    connector: Arc<dyn HubConnector>,
    config: PushConfig,
    store: SharedStore,
    active: Mutex<Option<ActiveSession>>,
}

impl SyncCoordinator {
    pub fn new(connector: Arc<dyn HubConnector>, config: PushConfig, store: SharedStore) -> Self {
        Self {
            connector,
            config,
            store,
            active: Mutex::new(None),
        }
    }

    /// Bind to a session credential.
    ///
    /// Handlers are bound before the connection starts. A failed start is
    /// returned but leaves the handlers bound; binding the same credential
    /// again retries the start on the same client.
    pub async fn bind(&self, credential: Credential) -> Result<(), PushError> {
        let (client, previous) = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some(session) if session.credential == credential => {
                    (session.client.clone(), None)
                }
                _ => {
                    let client =
                        Arc::new(PushClient::new(self.connector.clone(), self.config.clone()));
                    self.bind_handlers(&client);
                    let previous = active.replace(ActiveSession {
                        credential: credential.clone(),
                        client: client.clone(),
                    });
                    info!("Sync bound to session");
                    (client, previous)
                }
            }
        };

        if let Some(previous) = previous {
            debug!("Credential changed, replacing push connection");
            Self::teardown(previous).await;
        }

        // Connecting may take a while; the lock stays free for state queries
        client.start(&credential).await
    }

    /// Unbind every handler and stop the connection. No-op when unbound.
    pub async fn unbind(&self) {
        let previous = self.active.lock().await.take();
        if let Some(session) = previous {
            Self::teardown(session).await;
            info!("Sync unbound from session");
        }
    }

    /// Follow the session until its holder goes away, then unbind
    pub async fn run(self: Arc<Self>, mut session: watch::Receiver<Option<Credential>>) {
        let mut previous: Option<Credential> = None;
        loop {
            let current = session.borrow_and_update().clone();
            if previous.is_some() && previous != current {
                // Old handlers go first so nothing refills the mirror
                self.unbind().await;
                self.store.apply(StoreUpdate::Cleared);
            }
            previous = current.clone();

            match current {
                Some(credential) => {
                    if let Err(e) = self.bind(credential).await {
                        warn!("Push channel unavailable: {}", e);
                    }
                }
                None => self.unbind().await,
            }

            if session.changed().await.is_err() {
                break;
            }
        }
        self.unbind().await;
    }

    /// Run [`SyncCoordinator::run`] on its own task
    pub fn spawn(self: &Arc<Self>, session: watch::Receiver<Option<Credential>>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(session))
    }

    /// Connection state of the bound client; `Disconnected` when unbound
    pub async fn state(&self) -> ConnectionState {
        match self.active.lock().await.as_ref() {
            Some(session) => session.client.state(),
            None => ConnectionState::Disconnected,
        }
    }

    /// Event names with a bound handler; empty when unbound
    pub async fn bound_events(&self) -> Vec<String> {
        match self.active.lock().await.as_ref() {
            Some(session) => session.client.subscribed_events(),
            None => Vec::new(),
        }
    }

    /// The push client of the current session
    pub async fn client(&self) -> Option<Arc<PushClient>> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|session| session.client.clone())
    }

    fn bind_handlers(&self, client: &PushClient) {
        for kind in EventKind::ALL {
            let store = self.store.clone();
            client.subscribe(kind.name(), move |arguments| match route(kind, arguments) {
                Ok(update) => {
                    store.apply_event(update);
                }
                Err(e) => warn!("Ignoring hub event: {}", e),
            });
        }
    }

    async fn teardown(session: ActiveSession) {
        for kind in EventKind::ALL {
            session.client.unsubscribe(kind.name());
        }
        session.client.stop().await;
    }
}
