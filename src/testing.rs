//! In-memory doubles for the network seams, shared by unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::api::{ApiRequest, ApiResponse, RequestExecutor, TransportError};
use crate::push::{HubConnector, HubLink, HubProtocol, PushError, RECORD_SEPARATOR};

/// Executor answering from a queue of canned responses
#[derive(Default)]
pub(crate) struct MockExecutor {
    responses: Mutex<VecDeque<Result<ApiResponse, TransportError>>>,
    requests: Mutex<Vec<ApiRequest>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response; `Value::Null` stands for an empty body
    pub fn respond(&self, status: u16, body: Value) {
        let body = if body.is_null() {
            String::new()
        } else {
            body.to_string()
        };
        self.responses
            .lock()
            .push_back(Ok(ApiResponse::new(status, body)));
    }

    /// Queue a transport failure
    pub fn fail(&self, reason: &str) {
        self.responses
            .lock()
            .push_back(Err(TransportError(reason.to_string())));
    }

    /// Hold the next response until the returned gate is notified
    pub fn hold_next(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl RequestExecutor for MockExecutor {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        self.requests.lock().push(request);
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError("no canned response".to_string())))
    }
}

/// Server end of an in-memory hub connection.
///
/// Dropping it closes the connection from the server side.
pub(crate) struct MemoryServer {
    to_client: mpsc::UnboundedSender<Result<String, PushError>>,
    from_client: mpsc::UnboundedReceiver<String>,
    buffered: VecDeque<String>,
}

impl MemoryServer {
    pub fn send_event(&self, target: &str, arguments: Vec<Value>) {
        self.send_raw(&HubProtocol::encode_invocation(target, &arguments));
    }

    pub fn send_raw(&self, frame: &str) {
        let _ = self.to_client.send(Ok(frame.to_string()));
    }

    /// Next record the client sent, without its separator
    pub async fn next_record(&mut self) -> Option<String> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                return Some(record);
            }
            let frame = self.from_client.recv().await?;
            self.buffered.extend(
                frame
                    .split_terminator(RECORD_SEPARATOR)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string),
            );
        }
    }
}

/// Connector handing out in-memory links.
///
/// Each successful connect yields a [`MemoryServer`] on the receiver returned
/// by the constructor. The handshake reply is queued up front.
pub(crate) struct MemoryConnector {
    servers: mpsc::UnboundedSender<MemoryServer>,
    handshake_reply: String,
    tokens: Mutex<Vec<String>>,
    failures: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryServer>) {
        Self::with_handshake_reply(format!("{{}}{}", RECORD_SEPARATOR))
    }

    /// Every handshake is answered with `error`
    pub fn rejecting(error: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryServer>) {
        let reply = serde_json::json!({ "error": error }).to_string();
        Self::with_handshake_reply(format!("{}{}", reply, RECORD_SEPARATOR))
    }

    /// Handshakes are never answered
    pub fn silent() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryServer>) {
        Self::with_handshake_reply(String::new())
    }

    fn with_handshake_reply(reply: String) -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            servers,
            handshake_reply: reply,
            tokens: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// Refuse the next `count` connects
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Access tokens of every connect attempt, in order
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }
}

#[async_trait]
impl HubConnector for MemoryConnector {
    async fn connect(&self, access_token: &str) -> Result<HubLink, PushError> {
        self.tokens.lock().push(access_token.to_string());

        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(PushError::Connect("connection refused".to_string()));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        if !self.handshake_reply.is_empty() {
            let _ = to_client.send(Ok(self.handshake_reply.clone()));
        }

        let server = MemoryServer {
            to_client,
            from_client,
            buffered: VecDeque::new(),
        };
        let _ = self.servers.send(server);

        Ok(HubLink { incoming, outgoing })
    }
}

/// Poll `condition` until it holds, failing the test after about a second
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
