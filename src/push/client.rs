//! Push channel client.
//!
//! Maintains at most one live hub connection per client:
//! - `start` opens the transport, performs the handshake and spawns the
//!   connection task
//! - the connection task dispatches invocations to handlers, sends keep-alive
//!   pings and reconnects with the configured delays after a drop
//! - `stop` shuts the task down and forces `Disconnected`

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::protocol::{normalize_event_name, HubMessage, HubProtocol, ProtocolError};
use crate::session::Credential;

/// Grace period for the connection task to wind down in `stop`
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Push channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Not connected")]
    NotConnected,
}

/// Lifecycle of the hub connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Push channel timing
#[derive(Debug, Clone, PartialEq)]
pub struct PushConfig {
    /// Interval between client pings
    pub keep_alive_interval: Duration,
    /// Silence after which the connection counts as dropped
    pub server_timeout: Duration,
    /// Time allowed for the handshake response
    pub handshake_timeout: Duration,
    /// Delay before each reconnect attempt
    pub reconnect_delays: Vec<Duration>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            reconnect_delays: [0, 2, 10, 30].into_iter().map(Duration::from_secs).collect(),
        }
    }
}

/// Handler for one hub event; receives the invocation arguments
pub type EventHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Text frames to and from an open transport.
///
/// The transport is gone once `incoming` yields `None`. Dropping the link
/// closes it.
pub struct HubLink {
    pub incoming: mpsc::UnboundedReceiver<Result<String, PushError>>,
    pub outgoing: mpsc::UnboundedSender<String>,
}

/// Opens transports to the hub
#[async_trait]
pub trait HubConnector: Send + Sync {
    /// Open a transport authenticated with `access_token`. The handshake is
    /// performed by the caller.
    async fn connect(&self, access_token: &str) -> Result<HubLink, PushError>;
}

struct ConnectionHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Client for the server's event hub
pub struct PushClient {
    connector: Arc<dyn HubConnector>,
    config: PushConfig,
    handlers: Arc<DashMap<String, EventHandler>>,
    state: Arc<watch::Sender<ConnectionState>>,
    connection: Mutex<Option<ConnectionHandle>>,
}

impl PushClient {
    pub fn new(connector: Arc<dyn HubConnector>, config: PushConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            config,
            handlers: Arc::new(DashMap::new()),
            state: Arc::new(state),
            connection: Mutex::new(None),
        }
    }

    /// Connect with `credential`. Resolves immediately if a connection is
    /// already live (or reconnecting).
    pub async fn start(&self, credential: &Credential) -> Result<(), PushError> {
        let mut connection = self.connection.lock().await;

        if let Some(handle) = connection.as_ref() {
            if !handle.task.is_finished() && self.state() != ConnectionState::Disconnected {
                debug!("Hub connection already active");
                return Ok(());
            }
        }
        if let Some(stale) = connection.take() {
            stale.task.abort();
        }

        self.state.send_replace(ConnectionState::Connecting);
        info!("Connecting to hub");

        match open_link(self.connector.as_ref(), credential.as_str(), &self.config).await {
            Ok((link, pending)) => {
                self.state.send_replace(ConnectionState::Connected);
                info!("Hub connected");

                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                let runner = ConnectionRunner {
                    connector: self.connector.clone(),
                    config: self.config.clone(),
                    handlers: self.handlers.clone(),
                    state: self.state.clone(),
                    access_token: credential.as_str().to_string(),
                };
                let task = tokio::spawn(runner.run(link, pending, shutdown_rx));
                *connection = Some(ConnectionHandle {
                    shutdown: shutdown_tx,
                    task,
                });
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                error!("Failed to connect to hub: {}", e);
                Err(e)
            }
        }
    }

    /// Tear the connection down. Safe when not connected.
    pub async fn stop(&self) {
        let mut connection = self.connection.lock().await;

        if let Some(ConnectionHandle { shutdown, mut task }) = connection.take() {
            let _ = shutdown.send(());
            if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("Hub connection task did not stop in time, aborting");
                task.abort();
            }
            info!("Hub connection stopped");
        }

        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Bind `handler` to an event. Replaces any handler already bound to the
    /// same (normalized) name.
    pub fn subscribe<F>(&self, event_name: &str, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let name = normalize_event_name(event_name);
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            debug!("Replaced handler for '{}'", name);
        } else {
            debug!("Subscribed to '{}'", name);
        }
    }

    /// Remove the handler for an event. Returns whether one was bound.
    pub fn unsubscribe(&self, event_name: &str) -> bool {
        let name = normalize_event_name(event_name);
        self.handlers.remove(&name).is_some()
    }

    /// Names with a bound handler, sorted
    pub fn subscribed_events(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Follow state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

/// Open a transport and complete the handshake.
///
/// Returns the link plus any records that arrived in the handshake frame.
async fn open_link(
    connector: &dyn HubConnector,
    access_token: &str,
    config: &PushConfig,
) -> Result<(HubLink, Option<String>), PushError> {
    let mut link = connector.connect(access_token).await?;

    link.outgoing
        .send(HubProtocol::handshake_request())
        .map_err(|_| PushError::Closed("transport closed before handshake".to_string()))?;

    let frame = match tokio::time::timeout(config.handshake_timeout, link.incoming.recv()).await {
        Err(_) => return Err(PushError::HandshakeTimeout),
        Ok(None) => {
            return Err(PushError::Closed(
                "transport closed during handshake".to_string(),
            ))
        }
        Ok(Some(Err(e))) => return Err(e),
        Ok(Some(Ok(frame))) => frame,
    };

    let (response, rest) = HubProtocol::parse_handshake(&frame)?;
    if let Some(error) = response.error {
        return Err(PushError::HandshakeRejected(error));
    }

    let pending = (!rest.is_empty()).then(|| rest.to_string());
    Ok((link, pending))
}

/// Why a link stopped pumping
enum LinkOutcome {
    Shutdown,
    Dropped { reason: String, reconnect: bool },
}

/// State moved into the connection task
struct ConnectionRunner {
    connector: Arc<dyn HubConnector>,
    config: PushConfig,
    handlers: Arc<DashMap<String, EventHandler>>,
    state: Arc<watch::Sender<ConnectionState>>,
    access_token: String,
}

impl ConnectionRunner {
    async fn run(
        self,
        mut link: HubLink,
        mut pending: Option<String>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            match self.pump(&mut link, pending.take(), &mut shutdown).await {
                LinkOutcome::Shutdown => {
                    let _ = link.outgoing.send(HubProtocol::encode_close(None, false));
                    break;
                }
                LinkOutcome::Dropped {
                    reason,
                    reconnect: false,
                } => {
                    info!("Hub closed the connection: {}", reason);
                    break;
                }
                LinkOutcome::Dropped {
                    reason,
                    reconnect: true,
                } => {
                    warn!("Hub connection lost: {}", reason);
                    self.state.send_replace(ConnectionState::Reconnecting);

                    match self.reconnect(&mut shutdown).await {
                        Some((next, rest)) => {
                            link = next;
                            pending = rest;
                            self.state.send_replace(ConnectionState::Connected);
                            info!("Hub reconnected");
                        }
                        None => break,
                    }
                }
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Drive one link until it drops or shutdown is requested
    async fn pump(
        &self,
        link: &mut HubLink,
        pending: Option<String>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> LinkOutcome {
        if let Some(frame) = pending {
            if let Some(outcome) = self.handle_frame(&frame) {
                return outcome;
            }
        }

        let period = self.config.keep_alive_interval;
        let mut keep_alive = tokio::time::interval_at(Instant::now() + period, period);
        let idle = tokio::time::sleep(self.config.server_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = &mut *shutdown => return LinkOutcome::Shutdown,

                _ = keep_alive.tick() => {
                    trace!("Sending keep-alive ping");
                    if link.outgoing.send(HubProtocol::encode_ping()).is_err() {
                        return LinkOutcome::Dropped {
                            reason: "transport closed".to_string(),
                            reconnect: true,
                        };
                    }
                }

                _ = &mut idle => {
                    return LinkOutcome::Dropped {
                        reason: format!(
                            "no message from server in {}ms",
                            self.config.server_timeout.as_millis()
                        ),
                        reconnect: true,
                    };
                }

                frame = link.incoming.recv() => match frame {
                    Some(Ok(text)) => {
                        idle.as_mut().reset(Instant::now() + self.config.server_timeout);
                        if let Some(outcome) = self.handle_frame(&text) {
                            return outcome;
                        }
                    }
                    Some(Err(e)) => {
                        return LinkOutcome::Dropped {
                            reason: e.to_string(),
                            reconnect: true,
                        };
                    }
                    None => {
                        return LinkOutcome::Dropped {
                            reason: "transport closed".to_string(),
                            reconnect: true,
                        };
                    }
                },
            }
        }
    }

    /// Dispatch every record in a frame. Returns an outcome if the server
    /// asked to close.
    fn handle_frame(&self, frame: &str) -> Option<LinkOutcome> {
        let messages = match HubProtocol::decode(frame) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Dropping malformed hub frame: {}", e);
                return None;
            }
        };

        for message in messages {
            match message {
                HubMessage::Invocation {
                    target, arguments, ..
                } => self.dispatch(&target, &arguments),
                HubMessage::Ping => trace!("Hub ping"),
                HubMessage::Close {
                    error,
                    allow_reconnect,
                } => {
                    return Some(LinkOutcome::Dropped {
                        reason: error.unwrap_or_else(|| "server closed the connection".to_string()),
                        reconnect: allow_reconnect,
                    });
                }
                HubMessage::Ignored(kind) => debug!("Ignoring hub message {:?}", kind),
            }
        }
        None
    }

    fn dispatch(&self, target: &str, arguments: &[Value]) {
        let name = normalize_event_name(target);
        // Clone out so the map is not locked while the handler runs
        let handler = self.handlers.get(&name).map(|entry| entry.value().clone());
        match handler {
            Some(handler) => handler(arguments),
            None => debug!("No handler for hub event '{}'", name),
        }
    }

    /// Walk the reconnect delays. `None` means give up (or shutdown).
    async fn reconnect(
        &self,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Option<(HubLink, Option<String>)> {
        let attempts = self.config.reconnect_delays.len();

        for (attempt, delay) in self.config.reconnect_delays.iter().enumerate() {
            tokio::select! {
                _ = &mut *shutdown => return None,
                _ = tokio::time::sleep(*delay) => {}
            }

            info!("Reconnecting to hub (attempt {}/{})", attempt + 1, attempts);
            let result = tokio::select! {
                _ = &mut *shutdown => return None,
                result = open_link(self.connector.as_ref(), &self.access_token, &self.config) => result,
            };

            match result {
                Ok(opened) => return Some(opened),
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt + 1, e),
            }
        }

        error!("Giving up on hub after {} reconnect attempts", attempts);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, MemoryConnector};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> PushConfig {
        PushConfig {
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(1),
            reconnect_delays: vec![Duration::ZERO, Duration::from_millis(10)],
        }
    }

    fn credential() -> Credential {
        Credential::new("token-1").unwrap()
    }

    fn counter(client: &PushClient, event: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        client.subscribe(event, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (connector, mut servers) = MemoryConnector::new();
        let client = PushClient::new(connector.clone(), fast_config());

        client.start(&credential()).await.unwrap();
        client.start(&credential()).await.unwrap();

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(connector.tokens(), vec!["token-1".to_string()]);
        let mut server = servers.recv().await.unwrap();
        let handshake = server.next_record().await.unwrap();
        assert!(handshake.contains("\"protocol\":\"json\""));

        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_handshake_rejection_fails_start() {
        let (connector, _servers) = MemoryConnector::rejecting("Unauthorized");
        let client = PushClient::new(connector, fast_config());

        let err = client.start(&credential()).await.unwrap_err();
        assert_eq!(err, PushError::HandshakeRejected("Unauthorized".to_string()));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_retried() {
        let (connector, _servers) = MemoryConnector::new();
        connector.fail_next(1);
        let client = PushClient::new(connector.clone(), fast_config());

        assert!(client.start(&credential()).await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.tokens().len(), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_pascal_case_target_reaches_camel_case_handler() {
        let (connector, mut servers) = MemoryConnector::new();
        let client = PushClient::new(connector, fast_config());
        let created = counter(&client, "categoryCreated");

        client.start(&credential()).await.unwrap();
        let server = servers.recv().await.unwrap();
        server.send_event("CategoryCreated", vec![json!({"id": 1, "name": "Home"})]);
        server.send_event("categoryCreated", vec![json!({"id": 2, "name": "Work"})]);
        server.send_raw("{\"type\":6}\u{1e}");

        eventually(|| created.load(Ordering::SeqCst) == 2).await;
        client.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_replaces_and_unsubscribe_removes() {
        let (connector, _servers) = MemoryConnector::new();
        let client = PushClient::new(connector, fast_config());

        let first = counter(&client, "itemCreated");
        let second = counter(&client, "ItemCreated");
        assert_eq!(client.subscribed_events(), vec!["itemCreated".to_string()]);

        let handler = client.handlers.get("itemCreated").map(|h| h.value().clone());
        let no_args: Vec<Value> = Vec::new();
        handler.unwrap()(no_args.as_slice());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        assert!(client.unsubscribe("itemCreated"));
        assert!(!client.unsubscribe("itemCreated"));
        assert!(client.subscribed_events().is_empty());
    }

    #[tokio::test]
    async fn test_reconnects_with_same_token_after_drop() {
        let (connector, mut servers) = MemoryConnector::new();
        let client = PushClient::new(connector.clone(), fast_config());
        let deleted = counter(&client, "itemDeleted");

        client.start(&credential()).await.unwrap();
        let first = servers.recv().await.unwrap();
        drop(first);

        let second = servers.recv().await.unwrap();
        eventually(|| client.state() == ConnectionState::Connected).await;
        assert_eq!(
            connector.tokens(),
            vec!["token-1".to_string(), "token-1".to_string()]
        );

        second.send_event("itemDeleted", vec![json!(5)]);
        eventually(|| deleted.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(deleted.load(Ordering::SeqCst), 1);

        client.stop().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_last_delay() {
        let (connector, mut servers) = MemoryConnector::new();
        let client = PushClient::new(connector.clone(), fast_config());

        client.start(&credential()).await.unwrap();
        connector.fail_next(2);
        drop(servers.recv().await.unwrap());

        eventually(|| client.state() == ConnectionState::Disconnected).await;
        // Initial connect plus one attempt per delay
        assert_eq!(connector.tokens().len(), 3);
    }

    #[tokio::test]
    async fn test_close_without_reconnect_ends_connection() {
        let (connector, mut servers) = MemoryConnector::new();
        let client = PushClient::new(connector.clone(), fast_config());

        client.start(&credential()).await.unwrap();
        let server = servers.recv().await.unwrap();
        server.send_raw(&HubProtocol::encode_close(Some("Server shutting down"), false));

        eventually(|| client.state() == ConnectionState::Disconnected).await;
        assert_eq!(connector.tokens().len(), 1);
    }

    #[tokio::test]
    async fn test_server_timeout_triggers_reconnect() {
        let (connector, mut servers) = MemoryConnector::new();
        let config = PushConfig {
            keep_alive_interval: Duration::from_millis(20),
            server_timeout: Duration::from_millis(150),
            handshake_timeout: Duration::from_secs(1),
            reconnect_delays: vec![Duration::ZERO],
        };
        let client = PushClient::new(connector.clone(), config);

        client.start(&credential()).await.unwrap();
        let mut silent = servers.recv().await.unwrap();
        let _handshake = silent.next_record().await;

        // The client keeps pinging while the server stays silent
        let ping = silent.next_record().await.unwrap();
        assert_eq!(ping, "{\"type\":6}");

        let _second = servers.recv().await.unwrap();
        assert_eq!(connector.tokens().len(), 2);
        client.stop().await;
    }
}
