//! Answer Service Backends
//!
//! This module provides access to the answer service through a common trait
//! interface.
//!
//! # Available Backends
//!
//! - **HTTP**: The real service (default)
//! - **Scripted**: Queued in-memory responses for tests
//!
//! # Usage
//!
//! ```ignore
//! use medqa_core::backend::{ChatBackend, ChatRequest, HttpBackend, ModelSource};
//!
//! let backend = HttpBackend::new("http://127.0.0.1:8000")?;
//! let request = ChatRequest::new("头痛怎么办", ModelSource::Local, "qwen2.5:7b");
//! let body = backend.open_stream(&request).await?;
//! ```

mod http;
mod scripted;
mod traits;

pub use http::{HttpBackend, DEFAULT_CONNECT_TIMEOUT};
pub use scripted::{LiveScript, ScriptStep, ScriptedBackend};
pub use traits::{
    BackendError, ByteStream, ChatBackend, ChatRequest, GraphStatus, ModelCatalog, ModelSource,
    GRAPH_CONNECT_FAILED_TEXT, GRAPH_STATUS_FAILED_TEXT,
};
