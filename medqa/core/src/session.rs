//! Stream Session
//!
//! Drives one generation request end to end: opens the answer stream, feeds
//! it through the [`FrameSplitter`] and [`decode_line`], and reports the
//! result through [`StreamCallbacks`].
//!
//! # Life Cycle
//!
//! ```text
//! Idle ──▶ Opening ──▶ Streaming ──▶ Terminated
//!             │                          ▲
//!             └──── open failed ─────────┘
//! ```
//!
//! Whatever happens, `on_done` is called exactly once. Failures that never
//! reach the protocol (refused connection, empty body, broken transport, idle
//! timeout) are reported through `on_error` right before it. Undecodable lines
//! are logged and skipped.
//!
//! Dropping the future returned by [`StreamSession::run`] cancels the session;
//! no callback fires afterwards.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backend::{ByteStream, ChatBackend, ChatRequest};
use crate::messages::{CONNECTION_FAILED_TEXT, IDLE_TIMEOUT_TEXT, STREAM_READ_FAILED_PREFIX};
use crate::protocol::{decode_line, FrameSplitter, MetaEvent, StreamEvent, TrailingLinePolicy};

/// Default time to wait for the next chunk before giving up
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Unique identifier for a stream session
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new unique session ID
    ///
    /// Uses an atomic counter combined with timestamp to ensure uniqueness
    /// even when multiple sessions are created in the same millisecond.
    #[must_use]
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let count = COUNTER.fetch_add(1, Ordering::SeqCst);
        let timestamp = chrono::Utc::now().timestamp_millis();
        Self(format!("stream_{timestamp}_{count}"))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet run
    Idle,
    /// Waiting for the service to accept the request
    Opening,
    /// Reading the body
    Streaming,
    /// `on_done` has been called
    Terminated,
}

/// How a session ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The service sent `done`
    Completed,
    /// The body closed without `done`
    EndOfStream,
    /// The stream could not be opened or delivered no body
    ConnectFailed,
    /// The transport broke mid-stream
    TransportFailed,
    /// No chunk arrived within the idle timeout
    TimedOut,
}

/// Tunables for a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum wait for the next chunk (`None` waits forever)
    pub idle_timeout: Option<Duration>,
    /// Handling of an unterminated final line
    pub trailing_line: TrailingLinePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            trailing_line: TrailingLinePolicy::default(),
        }
    }
}

/// Receiver of a session's events
///
/// Calls arrive in stream order. `on_done` is always the last call.
pub trait StreamCallbacks: Send {
    /// Analysis results arrived
    fn on_meta(&mut self, meta: MetaEvent);
    /// A text fragment arrived
    fn on_delta(&mut self, text: String);
    /// The service or the transport failed
    fn on_error(&mut self, message: String);
    /// The session is over
    fn on_done(&mut self);
}

/// Collects events in order (mostly useful in tests)
impl StreamCallbacks for Vec<StreamEvent> {
    fn on_meta(&mut self, meta: MetaEvent) {
        self.push(StreamEvent::Meta(meta));
    }

    fn on_delta(&mut self, text: String) {
        self.push(StreamEvent::Delta { text });
    }

    fn on_error(&mut self, message: String) {
        self.push(StreamEvent::Error { message });
    }

    fn on_done(&mut self) {
        self.push(StreamEvent::Done);
    }
}

/// Forwards events to a channel; a closed receiver silently drops them
impl StreamCallbacks for mpsc::UnboundedSender<StreamEvent> {
    fn on_meta(&mut self, meta: MetaEvent) {
        let _ = self.send(StreamEvent::Meta(meta));
    }

    fn on_delta(&mut self, text: String) {
        let _ = self.send(StreamEvent::Delta { text });
    }

    fn on_error(&mut self, message: String) {
        let _ = self.send(StreamEvent::Error { message });
    }

    fn on_done(&mut self) {
        let _ = self.send(StreamEvent::Done);
    }
}

/// Routes events to callbacks and guarantees a single `on_done`
struct Dispatcher<'a, C: StreamCallbacks + ?Sized> {
    callbacks: &'a mut C,
    done: bool,
}

impl<'a, C: StreamCallbacks + ?Sized> Dispatcher<'a, C> {
    fn new(callbacks: &'a mut C) -> Self {
        Self {
            callbacks,
            done: false,
        }
    }

    /// Returns true once the session is over
    fn dispatch(&mut self, event: StreamEvent) -> bool {
        if self.done {
            return true;
        }
        match event {
            StreamEvent::Meta(meta) => self.callbacks.on_meta(meta),
            StreamEvent::Delta { text } => self.callbacks.on_delta(text),
            StreamEvent::Error { message } => self.callbacks.on_error(message),
            StreamEvent::Done => {
                self.done();
                return true;
            }
        }
        false
    }

    fn error(&mut self, message: impl Into<String>) {
        if !self.done {
            self.callbacks.on_error(message.into());
        }
    }

    fn done(&mut self) {
        if !self.done {
            self.done = true;
            self.callbacks.on_done();
        }
    }
}

/// One generation request
pub struct StreamSession {
    id: SessionId,
    backend: Arc<dyn ChatBackend>,
    request: ChatRequest,
    config: SessionConfig,
    state: SessionState,
    outcome: Option<SessionOutcome>,
}

impl StreamSession {
    /// Create a session; nothing is sent until [`run`](Self::run)
    #[must_use]
    pub fn new(backend: Arc<dyn ChatBackend>, request: ChatRequest, config: SessionConfig) -> Self {
        Self {
            id: SessionId::new(),
            backend,
            request,
            config,
            state: SessionState::Idle,
            outcome: None,
        }
    }

    /// Get the session ID
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Get the current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get the request this session sends
    #[must_use]
    pub fn request(&self) -> &ChatRequest {
        &self.request
    }

    /// Run the session to completion
    ///
    /// A session runs once. Running it again returns the first outcome
    /// without calling back.
    pub async fn run<C: StreamCallbacks + ?Sized>(&mut self, callbacks: &mut C) -> SessionOutcome {
        if let Some(outcome) = self.outcome {
            tracing::warn!(session = %self.id, "Session already ran");
            return outcome;
        }

        let mut dispatcher = Dispatcher::new(callbacks);

        self.state = SessionState::Opening;
        tracing::debug!(
            session = %self.id,
            backend = self.backend.name(),
            model = %self.request.model_name,
            source = %self.request.model_source,
            "Opening answer stream"
        );

        let outcome = match self.open().await {
            Ok(body) => {
                self.state = SessionState::Streaming;
                self.read(body, &mut dispatcher).await
            }
            Err(outcome) => {
                let text = if outcome == SessionOutcome::TimedOut {
                    IDLE_TIMEOUT_TEXT
                } else {
                    CONNECTION_FAILED_TEXT
                };
                dispatcher.error(text);
                outcome
            }
        };

        dispatcher.done();
        self.state = SessionState::Terminated;
        self.outcome = Some(outcome);
        tracing::debug!(session = %self.id, ?outcome, "Answer stream closed");
        outcome
    }

    async fn open(&self) -> Result<ByteStream, SessionOutcome> {
        let opening = self.backend.open_stream(&self.request);
        let result = match self.config.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, opening).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(session = %self.id, ?limit, "Answer service did not respond");
                    return Err(SessionOutcome::TimedOut);
                }
            },
            None => opening.await,
        };

        result.map_err(|e| {
            tracing::warn!(session = %self.id, error = %e, "Failed to open answer stream");
            SessionOutcome::ConnectFailed
        })
    }

    async fn read<C: StreamCallbacks + ?Sized>(
        &self,
        mut body: ByteStream,
        dispatcher: &mut Dispatcher<'_, C>,
    ) -> SessionOutcome {
        let mut splitter = FrameSplitter::with_policy(self.config.trailing_line);
        let mut received = 0usize;

        loop {
            let next = match self.config.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, body.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!(session = %self.id, ?limit, "Answer stream idle, giving up");
                        dispatcher.error(IDLE_TIMEOUT_TEXT);
                        return SessionOutcome::TimedOut;
                    }
                },
                None => body.next().await,
            };

            match next {
                Some(Ok(chunk)) => {
                    received += chunk.len();
                    for line in splitter.push(&chunk) {
                        if self.dispatch_line(&line, dispatcher) {
                            return SessionOutcome::Completed;
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(session = %self.id, error = %e, "Answer stream broke");
                    dispatcher.error(format!("{STREAM_READ_FAILED_PREFIX}{e}"));
                    return SessionOutcome::TransportFailed;
                }
                None => break,
            }
        }

        if received == 0 {
            tracing::warn!(session = %self.id, "Answer stream closed without a body");
            dispatcher.error(CONNECTION_FAILED_TEXT);
            return SessionOutcome::ConnectFailed;
        }

        if let Some(line) = splitter.finish() {
            if self.dispatch_line(&line, dispatcher) {
                return SessionOutcome::Completed;
            }
        }
        SessionOutcome::EndOfStream
    }

    fn dispatch_line<C: StreamCallbacks + ?Sized>(
        &self,
        line: &str,
        dispatcher: &mut Dispatcher<'_, C>,
    ) -> bool {
        match decode_line(line) {
            Ok(event) => dispatcher.dispatch(event),
            Err(failure) => {
                tracing::warn!(
                    session = %self.id,
                    reason = %failure.reason,
                    line = %failure.raw_line,
                    "Skipping undecodable stream line"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
