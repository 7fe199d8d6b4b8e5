//! Request/response command layer.
//!
//! Commands go through a [`RequestExecutor`] (plain HTTP in production, canned
//! responses in tests). A command only touches the store after the server has
//! acknowledged it, and then applies exactly one [`StoreUpdate`].
//!
//! [`StoreUpdate`]: crate::store::StoreUpdate

mod commands;
mod http;

pub use commands::Commands;
pub use http::HttpExecutor;

use async_trait::async_trait;
use serde::Deserialize;

/// HTTP verb of an API request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// A request against the API, relative to the configured base URL
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Path below the base URL, without a leading slash (`Items/42/complete`)
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Bearer token, attached when a session is present
    pub bearer: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            bearer: None,
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }
}

/// Raw response: status code and body text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The request never produced a response (DNS, refused, timeout, ...)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Executes API requests. The command layer's only view of the network.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Standard response body: `{ "data": ..., "message": ..., "success": ... }`
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub data: Option<T>,
    pub message: Option<String>,
    pub success: Option<bool>,
}

/// Failure of a command. `Display` is the human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Rejected locally before any request was made
    #[error("{0}")]
    Validation(String),

    /// The server answered with an error
    #[error("{message}")]
    Rejected { status: u16, message: String },

    /// No response from the server; `message` is the operation's fallback text
    #[error("{message}")]
    Transport { message: String, cause: String },

    /// The server acknowledged but the body was not what the operation expects
    #[error("{message}")]
    Decode { message: String, cause: String },
}

impl CommandError {
    /// HTTP status of a server rejection
    pub fn status(&self) -> Option<u16> {
        match self {
            CommandError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

/// Extract the server's reason from an error body, if any
pub(crate) fn server_message(body: &str) -> Option<String> {
    serde_json::from_str::<ApiEnvelope<serde_json::Value>>(body)
        .ok()
        .and_then(|envelope| envelope.message)
        .map(|message| message.trim().to_string())
        .filter(|message| !message.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_extraction() {
        assert_eq!(
            server_message(r#"{"success":false,"message":"Category is in use"}"#),
            Some("Category is in use".to_string())
        );
        assert_eq!(server_message(r#"{"message":"  "}"#), None);
        assert_eq!(server_message("<html>502</html>"), None);
        assert_eq!(server_message(""), None);
    }

    #[test]
    fn test_command_error_display_is_reason() {
        let err = CommandError::Rejected {
            status: 409,
            message: "Category is in use".to_string(),
        };
        assert_eq!(err.to_string(), "Category is in use");
        assert_eq!(err.status(), Some(409));

        let err = CommandError::Transport {
            message: "Failed to create category".to_string(),
            cause: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to create category");
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_envelope_without_data() {
        let envelope: ApiEnvelope<bool> = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(envelope.data.is_none());
        assert_eq!(envelope.success, Some(true));
    }
}
