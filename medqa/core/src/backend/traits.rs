//! Answer Service Traits
//!
//! Trait definitions for the answer-generation service. This abstraction lets
//! the stream session and the conversation store run against the real HTTP
//! service or an in-memory script without changing core logic.
//!
//! # Design Philosophy
//!
//! The `ChatBackend` trait provides a common interface for:
//! - Opening the streamed answer body for a query
//! - Fetching the model catalog
//! - Reading and changing the graph database connection
//!
//! The streamed body is handed out as raw bytes. Framing and decoding live in
//! [`crate::protocol`], so every backend gets the same parsing rules.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status error text when the graph status endpoint fails
pub const GRAPH_STATUS_FAILED_TEXT: &str = "无法获取状态";

/// Status error text when the graph connect endpoint fails
pub const GRAPH_CONNECT_FAILED_TEXT: &str = "连接失败";

/// Raw response body, chunked at transport-chosen boundaries
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;

/// Errors raised by a backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The HTTP layer failed (connect, TLS, body read)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status
    #[error("service returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// The configured base URL does not parse
    #[error("invalid service URL `{0}`")]
    InvalidUrl(String),

    /// The body stream broke mid-way
    #[error("stream interrupted: {0}")]
    Stream(String),

    /// The backend refused to open a stream
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Where the generation model runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    /// A model served by the local Ollama instance
    #[default]
    Local,
    /// A hosted SiliconFlow model (needs an API key)
    Siliconflow,
}

impl ModelSource {
    /// Whether requests for this source carry an API key
    #[must_use]
    pub fn needs_api_key(self) -> bool {
        matches!(self, Self::Siliconflow)
    }
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Siliconflow => write!(f, "siliconflow"),
        }
    }
}

impl std::str::FromStr for ModelSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "siliconflow" => Ok(Self::Siliconflow),
            other => Err(format!("unknown model source `{other}`")),
        }
    }
}

/// Body of a streamed chat request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    /// The user's question
    pub query: String,
    /// Where the model runs
    pub model_source: ModelSource,
    /// Model identifier within the source
    pub model_name: String,
    /// SiliconFlow API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Graph database password, used by the service to connect on demand
    #[serde(rename = "neo4j_password", skip_serializing_if = "Option::is_none")]
    pub graph_password: Option<String>,
}

impl ChatRequest {
    /// Create a request without credentials
    pub fn new(
        query: impl Into<String>,
        model_source: ModelSource,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            query: query.into(),
            model_source,
            model_name: model_name.into(),
            api_key: None,
            graph_password: None,
        }
    }

    /// Attach an API key
    ///
    /// Only kept for sources that need one.
    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<&str>) -> Self {
        self.api_key = if self.model_source.needs_api_key() {
            api_key.map(str::to_string)
        } else {
            None
        };
        self
    }

    /// Attach the graph database password (empty means none)
    #[must_use]
    pub fn with_graph_password(mut self, password: Option<&str>) -> Self {
        self.graph_password = password.filter(|p| !p.is_empty()).map(str::to_string);
        self
    }
}

/// Models offered by the service, per source
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelCatalog {
    /// Local Ollama models
    pub local: Vec<String>,
    /// Hosted SiliconFlow models
    pub siliconflow: Vec<String>,
}

impl ModelCatalog {
    /// Models for one source
    #[must_use]
    pub fn models(&self, source: ModelSource) -> &[String] {
        match source {
            ModelSource::Local => &self.local,
            ModelSource::Siliconflow => &self.siliconflow,
        }
    }

    /// Whether no model is offered at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.siliconflow.is_empty()
    }
}

/// Connection state of the service's graph database
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStatus {
    /// Whether the service holds a live connection
    pub connected: bool,
    /// Last connection error, if any
    #[serde(default)]
    pub error: Option<String>,
}

impl GraphStatus {
    /// A disconnected status carrying an error text
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            connected: false,
            error: Some(error.into()),
        }
    }
}

/// Answer service backend
///
/// Implement this trait to point the client at a different transport.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Backend name for logs (e.g. "http")
    fn name(&self) -> &str;

    /// Open the streamed answer body for a request
    ///
    /// A returned stream means the service accepted the request; it may still
    /// turn out to be empty.
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, BackendError>;

    /// Fetch the model catalog
    async fn list_models(&self) -> Result<ModelCatalog, BackendError>;

    /// Read the graph database status
    async fn graph_status(&self) -> Result<GraphStatus, BackendError>;

    /// Ask the service to (re)connect its graph database
    async fn connect_graph(&self, password: Option<&str>) -> Result<GraphStatus, BackendError>;

    /// Fetch the model catalog, falling back to an empty one
    async fn models_or_empty(&self) -> ModelCatalog {
        match self.list_models().await {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::warn!(backend = self.name(), error = %e, "Model catalog unavailable");
                ModelCatalog::default()
            }
        }
    }

    /// Read the graph status, folding failures into a disconnected status
    async fn graph_status_or_unavailable(&self) -> GraphStatus {
        match self.graph_status().await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(backend = self.name(), error = %e, "Graph status unavailable");
                GraphStatus::unavailable(GRAPH_STATUS_FAILED_TEXT)
            }
        }
    }

    /// Connect the graph database, folding failures into a disconnected status
    async fn connect_graph_or_unavailable(&self, password: Option<&str>) -> GraphStatus {
        match self.connect_graph(password).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(backend = self.name(), error = %e, "Graph connect failed");
                GraphStatus::unavailable(GRAPH_CONNECT_FAILED_TEXT)
            }
        }
    }
}
