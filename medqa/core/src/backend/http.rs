//! HTTP Backend Implementation
//!
//! Talks to the answer service over HTTP(S).
//!
//! # Service API
//!
//! - `POST /api/chat/stream` - Streamed answer as newline-delimited JSON
//! - `GET /api/models` - Model catalog per source
//! - `GET /api/neo4j/status` - Graph database status
//! - `POST /api/neo4j/connect` - Reconnect the graph database
//!
//! Only a connect timeout is set on the client. Answer bodies can stream for a
//! long time; stalls are caught by the session's idle timeout instead.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;

use super::traits::{BackendError, ByteStream, ChatBackend, ChatRequest, GraphStatus, ModelCatalog};

/// Default connect timeout for the service
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP answer service client
#[derive(Clone, Debug)]
pub struct HttpBackend {
    /// Base URL without trailing slash
    base_url: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl HttpBackend {
    /// Create a backend with the default connect timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or the client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        Self::with_connect_timeout(base_url, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Create a backend with a custom connect timeout
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or the client cannot be built.
    pub fn with_connect_timeout(
        base_url: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url).map_err(|_| BackendError::InvalidUrl(base_url.clone()))?;

        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self {
            base_url,
            http_client,
        })
    }

    /// Get the base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn chat_stream_url(&self) -> String {
        self.url("/api/chat/stream")
    }

    fn models_url(&self) -> String {
        self.url("/api/models")
    }

    fn graph_status_url(&self) -> String {
        self.url("/api/neo4j/status")
    }

    fn graph_connect_url(&self) -> String {
        self.url("/api/neo4j/connect")
    }
}

/// Turn a non-success response into [`BackendError::Status`]
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status { status, body })
}

#[async_trait]
impl ChatBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, BackendError> {
        let response = self
            .http_client
            .post(self.chat_stream_url())
            .json(request)
            .send()
            .await?;
        let response = check_status(response).await?;

        tracing::debug!(
            url = %response.url(),
            model = %request.model_name,
            source = %request.model_source,
            "Answer stream opened"
        );

        Ok(Box::pin(response.bytes_stream().map_err(BackendError::from)))
    }

    async fn list_models(&self) -> Result<ModelCatalog, BackendError> {
        let response = self.http_client.get(self.models_url()).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn graph_status(&self) -> Result<GraphStatus, BackendError> {
        let response = self.http_client.get(self.graph_status_url()).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn connect_graph(&self, password: Option<&str>) -> Result<GraphStatus, BackendError> {
        let body = serde_json::json!({ "password": password });
        let response = self
            .http_client
            .post(self.graph_connect_url())
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_backend_creation() {
        let backend = HttpBackend::new("http://127.0.0.1:8000/").unwrap();
        assert_eq!(backend.base_url(), "http://127.0.0.1:8000");
        assert_eq!(backend.chat_stream_url(), "http://127.0.0.1:8000/api/chat/stream");
        assert_eq!(backend.models_url(), "http://127.0.0.1:8000/api/models");
        assert_eq!(backend.graph_status_url(), "http://127.0.0.1:8000/api/neo4j/status");
        assert_eq!(backend.graph_connect_url(), "http://127.0.0.1:8000/api/neo4j/connect");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let err = HttpBackend::new("not a url").unwrap_err();
        assert!(matches!(err, BackendError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_http_error() {
        // A port that was just freed has nothing listening on it
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend =
            HttpBackend::with_connect_timeout(format!("http://{addr}"), Duration::from_millis(500))
                .unwrap();
        let request = ChatRequest::new("q", crate::backend::ModelSource::Local, "m");
        let err = backend.open_stream(&request).await.err().unwrap();
        assert!(matches!(err, BackendError::Http(_)));

        let catalog = backend.models_or_empty().await;
        assert!(catalog.is_empty());

        let status = backend.graph_status_or_unavailable().await;
        assert!(!status.connected);
        assert_eq!(status.error.as_deref(), Some("无法获取状态"));
    }
}
