//! WebSocket transport for the hub.
//!
//! Connecting takes two steps:
//! - negotiate: `POST {hub}/negotiate?negotiateVersion=1` with the bearer
//!   token, which yields a connection token (and may redirect once)
//! - open the socket at the hub URL with `ws`/`wss`, passing the connection
//!   token as `id` and the credential as `access_token`
//!
//! The socket is then split into a reader and a writer task bridged to the
//! [`HubLink`] channels.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::client::{HubConnector, HubLink, PushError};

/// Negotiation redirects followed before giving up
const MAX_REDIRECTS: usize = 1;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    connection_token: Option<String>,
    connection_id: Option<String>,
    url: Option<String>,
    access_token: Option<String>,
    error: Option<String>,
}

/// Where to open the socket after negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
struct SocketTarget {
    hub_url: String,
    access_token: String,
    connection_token: Option<String>,
}

/// Connects to the hub over WebSocket
#[derive(Debug, Clone)]
pub struct WsConnector {
    http: reqwest::Client,
    hub_url: String,
    skip_negotiation: bool,
}

impl WsConnector {
    pub fn new(
        hub_url: impl Into<String>,
        request_timeout: Duration,
        skip_negotiation: bool,
    ) -> Result<Self, PushError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PushError::Connect(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            hub_url: hub_url.into(),
            skip_negotiation,
        })
    }

    async fn negotiate(&self, access_token: &str) -> Result<SocketTarget, PushError> {
        let mut hub_url = self.hub_url.clone();
        let mut token = access_token.to_string();

        for _ in 0..=MAX_REDIRECTS {
            let endpoint = negotiate_url(&hub_url)?;
            debug!("Negotiating hub connection at {}", endpoint);

            let response = self
                .http
                .post(endpoint)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| PushError::Negotiation(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(PushError::Negotiation(format!(
                    "server answered {}",
                    status.as_u16()
                )));
            }

            let body: NegotiateResponse = response
                .json()
                .await
                .map_err(|e| PushError::Negotiation(e.to_string()))?;

            if let Some(error) = body.error {
                return Err(PushError::Negotiation(error));
            }

            if let Some(redirect) = body.url {
                info!("Hub negotiation redirected to {}", redirect);
                hub_url = redirect;
                if let Some(redirect_token) = body.access_token {
                    token = redirect_token;
                }
                continue;
            }

            return Ok(SocketTarget {
                hub_url,
                access_token: token,
                connection_token: body.connection_token.or(body.connection_id),
            });
        }

        Err(PushError::Negotiation("too many redirects".to_string()))
    }
}

#[async_trait]
impl HubConnector for WsConnector {
    async fn connect(&self, access_token: &str) -> Result<HubLink, PushError> {
        let target = if self.skip_negotiation {
            SocketTarget {
                hub_url: self.hub_url.clone(),
                access_token: access_token.to_string(),
                connection_token: None,
            }
        } else {
            self.negotiate(access_token).await?
        };

        let url = socket_url(&target)?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| PushError::Connect(e.to_string()))?;
        debug!("Hub socket open");

        let (mut sink, mut stream) = socket.split();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();

        // Writer: runs until the link's sender side is dropped
        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!("Hub socket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: runs until the socket closes or the link is dropped
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Dropping non-UTF-8 hub frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        debug!("Hub socket closed: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = incoming_tx.send(Err(PushError::Closed(e.to_string())));
                        break;
                    }
                };
                if incoming_tx.send(Ok(frame)).is_err() {
                    break;
                }
            }
        });

        Ok(HubLink {
            incoming: incoming_rx,
            outgoing: outgoing_tx,
        })
    }
}

/// `{hub}/negotiate?negotiateVersion=1`, keeping any query already on the hub URL
fn negotiate_url(hub_url: &str) -> Result<Url, PushError> {
    let mut url =
        Url::parse(hub_url).map_err(|e| PushError::Negotiation(format!("{}: {}", hub_url, e)))?;
    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url)
}

/// Socket URL: `http` becomes `ws`, `https` becomes `wss`
fn socket_url(target: &SocketTarget) -> Result<Url, PushError> {
    let mut url = Url::parse(&target.hub_url)
        .map_err(|e| PushError::Connect(format!("{}: {}", target.hub_url, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(PushError::Connect(format!(
                "unsupported hub URL scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| PushError::Connect(format!("cannot use {} for the hub", scheme)))?;

    {
        let mut query = url.query_pairs_mut();
        if let Some(id) = &target.connection_token {
            query.append_pair("id", id);
        }
        query.append_pair("access_token", &target.access_token);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_url() {
        let url = negotiate_url("http://localhost:5000/active").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:5000/active/negotiate?negotiateVersion=1"
        );

        let url = negotiate_url("https://host/hubs/active/").unwrap();
        assert_eq!(
            url.as_str(),
            "https://host/hubs/active/negotiate?negotiateVersion=1"
        );
    }

    #[test]
    fn test_socket_url_switches_scheme() {
        let url = socket_url(&SocketTarget {
            hub_url: "http://localhost:5000/active".to_string(),
            access_token: "abc".to_string(),
            connection_token: Some("conn-1".to_string()),
        })
        .unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:5000/active?id=conn-1&access_token=abc"
        );

        let url = socket_url(&SocketTarget {
            hub_url: "https://tasks.example.com/active".to_string(),
            access_token: "abc".to_string(),
            connection_token: None,
        })
        .unwrap();
        assert_eq!(url.as_str(), "wss://tasks.example.com/active?access_token=abc");
    }

    #[test]
    fn test_socket_url_rejects_other_schemes() {
        let result = socket_url(&SocketTarget {
            hub_url: "ftp://host/active".to_string(),
            access_token: "abc".to_string(),
            connection_token: None,
        });
        assert!(matches!(result, Err(PushError::Connect(_))));
    }

    #[tokio::test]
    async fn test_negotiation_failure_surfaces_as_error() {
        let connector =
            WsConnector::new("http://127.0.0.1:9/active", Duration::from_millis(500), false)
                .unwrap();
        let result = connector.connect("abc").await;
        assert!(matches!(result, Err(PushError::Negotiation(_))));
    }
}
