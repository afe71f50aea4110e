//! Scripted Backend
//!
//! In-memory [`ChatBackend`] that replays queued responses, for tests that
//! need exact control over chunk boundaries and timing.
//!
//! # Usage
//!
//! ```ignore
//! use medqa_core::backend::ScriptedBackend;
//!
//! let backend = ScriptedBackend::new();
//! backend.push_lines(&[r#"{"type":"delta","content":"多休息"}"#, r#"{"type":"done"}"#]);
//!
//! // Drive chunks by hand for interleaving tests
//! let live = backend.push_live();
//! live.chunk(b"{\"type\":\"delta\",\"content\":\"a\"}\n");
//! live.finish();
//!
//! // Afterwards, check what was sent
//! assert_eq!(backend.requests().len(), 2);
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::protocol::StreamEvent;

use super::traits::{
    BackendError, ByteStream, ChatBackend, ChatRequest, GraphStatus, ModelCatalog,
};

/// One step of a scripted response body
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Deliver these bytes as one chunk
    Chunk(Bytes),
    /// Raise a mid-stream transport error
    Fail(String),
    /// Stop delivering without closing the body
    Stall,
}

impl ScriptStep {
    /// A chunk from anything byte-like
    pub fn chunk(bytes: impl Into<Bytes>) -> Self {
        Self::Chunk(bytes.into())
    }

    fn into_item(self) -> Option<Result<Bytes, BackendError>> {
        match self {
            Self::Chunk(bytes) => Some(Ok(bytes)),
            Self::Fail(message) => Some(Err(BackendError::Stream(message))),
            Self::Stall => None,
        }
    }
}

enum Script {
    Refuse(String),
    Hang,
    Steps(Vec<ScriptStep>),
    Live(mpsc::UnboundedReceiver<ScriptStep>),
}

/// Sender half of a hand-driven response body
///
/// The body ends when this handle is dropped or [`LiveScript::finish`] is called.
#[derive(Debug)]
pub struct LiveScript {
    tx: mpsc::UnboundedSender<ScriptStep>,
}

impl LiveScript {
    /// Deliver one chunk
    ///
    /// Returns false once the session stopped reading.
    pub fn chunk(&self, bytes: impl Into<Bytes>) -> bool {
        self.tx.send(ScriptStep::Chunk(bytes.into())).is_ok()
    }

    /// Deliver one protocol line (newline appended)
    pub fn line(&self, line: &str) -> bool {
        self.chunk(format!("{line}\n"))
    }

    /// Raise a mid-stream transport error
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.tx.send(ScriptStep::Fail(message.into())).is_ok()
    }

    /// Close the body
    pub fn finish(self) {}
}

/// Backend that serves queued scripts in order
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
    catalog: Mutex<Option<ModelCatalog>>,
    graph: Mutex<Option<GraphStatus>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    /// Create a backend with nothing queued
    ///
    /// With an empty queue every `open_stream` is refused.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            catalog: Mutex::new(None),
            graph: Mutex::new(None),
        }
    }

    /// Serve this catalog from `list_models` (otherwise a 500 is simulated)
    #[must_use]
    pub fn with_catalog(self, catalog: ModelCatalog) -> Self {
        *lock(&self.catalog) = Some(catalog);
        self
    }

    /// Serve this status from the graph endpoints (otherwise a 500 is simulated)
    #[must_use]
    pub fn with_graph_status(self, status: GraphStatus) -> Self {
        *lock(&self.graph) = Some(status);
        self
    }

    /// Queue a body made of explicit steps
    pub fn push_steps(&self, steps: Vec<ScriptStep>) {
        lock(&self.scripts).push_back(Script::Steps(steps));
    }

    /// Queue a body made of whole lines (one chunk each, newline appended)
    pub fn push_lines(&self, lines: &[&str]) {
        let steps = lines
            .iter()
            .map(|line| ScriptStep::chunk(format!("{line}\n")))
            .collect();
        self.push_steps(steps);
    }

    /// Queue a body encoding each event as one line
    ///
    /// # Errors
    ///
    /// Returns the serde error if an event cannot be encoded; nothing is queued then.
    pub fn push_events(&self, events: &[StreamEvent]) -> serde_json::Result<()> {
        let steps = events
            .iter()
            .map(|event| event.to_line().map(ScriptStep::chunk))
            .collect::<serde_json::Result<Vec<_>>>()?;
        self.push_steps(steps);
        Ok(())
    }

    /// Queue an exact byte body split into the given chunks
    pub fn push_chunks(&self, chunks: Vec<Vec<u8>>) {
        self.push_steps(chunks.into_iter().map(ScriptStep::chunk).collect());
    }

    /// Queue a refusal, as if the service were unreachable
    pub fn push_refusal(&self, reason: impl Into<String>) {
        lock(&self.scripts).push_back(Script::Refuse(reason.into()));
    }

    /// Queue a service that accepts the connection but never answers
    pub fn push_hang(&self) {
        lock(&self.scripts).push_back(Script::Hang);
    }

    /// Queue a body driven by hand through the returned handle
    pub fn push_live(&self) -> LiveScript {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.scripts).push_back(Script::Live(rx));
        LiveScript { tx }
    }

    /// Every request `open_stream` has received, in order
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    /// Number of scripts not yet consumed
    #[must_use]
    pub fn queued(&self) -> usize {
        lock(&self.scripts).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn server_error() -> BackendError {
    BackendError::Status {
        status: 500,
        body: "scripted failure".to_string(),
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, BackendError> {
        lock(&self.requests).push(request.clone());

        let script = lock(&self.scripts).pop_front();
        match script {
            None => Err(BackendError::Unavailable("no scripted response".to_string())),
            Some(Script::Refuse(reason)) => Err(BackendError::Unavailable(reason)),
            Some(Script::Hang) => future::pending().await,
            Some(Script::Steps(steps)) => {
                let stalls = steps.iter().any(|s| matches!(s, ScriptStep::Stall));
                let items: Vec<_> = steps
                    .into_iter()
                    .take_while(|s| !matches!(s, ScriptStep::Stall))
                    .filter_map(ScriptStep::into_item)
                    .collect();
                let body = stream::iter(items);
                if stalls {
                    Ok(Box::pin(body.chain(stream::pending())))
                } else {
                    Ok(Box::pin(body))
                }
            }
            Some(Script::Live(rx)) => Ok(Box::pin(
                UnboundedReceiverStream::new(rx).filter_map(|step| future::ready(step.into_item())),
            )),
        }
    }

    async fn list_models(&self) -> Result<ModelCatalog, BackendError> {
        lock(&self.catalog).clone().ok_or_else(server_error)
    }

    async fn graph_status(&self) -> Result<GraphStatus, BackendError> {
        lock(&self.graph).clone().ok_or_else(server_error)
    }

    async fn connect_graph(&self, password: Option<&str>) -> Result<GraphStatus, BackendError> {
        let mut graph = lock(&self.graph);
        let status = graph.as_mut().ok_or_else(server_error)?;
        if password.is_some() {
            *status = GraphStatus {
                connected: true,
                error: None,
            };
        }
        Ok(status.clone())
    }
}
