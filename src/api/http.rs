//! `reqwest`-backed request executor.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{ApiRequest, ApiResponse, Method, RequestExecutor, TransportError};

/// Sends API requests over HTTP relative to a base URL
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpExecutor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing client (connection pool, proxy settings, ...)
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(&request.path);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Patch => self.client.patch(&url),
            Method::Delete => self.client.delete(&url),
        };

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!("{} {}", request.method.as_str(), url);

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError(format!("Request failed: {}", e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError(format!("Failed to read response body: {}", e)))?;

        debug!("{} {} -> {}", request.method.as_str(), url, status);
        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        let executor = HttpExecutor::with_client(reqwest::Client::new(), "http://host/api/");
        assert_eq!(executor.base_url(), "http://host/api");
        assert_eq!(executor.url_for("Items/4/complete"), "http://host/api/Items/4/complete");
        assert_eq!(executor.url_for("/Categories"), "http://host/api/Categories");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let executor =
            HttpExecutor::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let result = executor.execute(ApiRequest::new(Method::Get, "Items")).await;
        assert!(result.is_err());
    }
}
