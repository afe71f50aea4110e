//! Conversation Store
//!
//! Holds the conversation windows and reconciles streamed events into them.
//! Several windows can stream at once while the user switches between them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ConversationStore                         │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐           │
//! │  │ 对话窗口 1    │ │ 对话窗口 2    │ │ 对话窗口 3    │           │
//! │  │ busy         │ │ idle         │ │ busy         │ ← active  │
//! │  └──────▲───────┘ └──────────────┘ └──────▲───────┘           │
//! │         │          StreamUpdate channel   │                   │
//! └─────────┼─────────────────────────────────┼───────────────────┘
//!           │                                 │
//!    ┌──────┴───────┐                  ┌──────┴───────┐
//!    │ StreamSession│ (spawned task)   │ StreamSession│
//!    └──────────────┘                  └──────────────┘
//! ```
//!
//! Sessions never touch the windows. They send [`StreamUpdate`]s tagged with
//! the window, the assistant message and the session, and the store applies
//! them one at a time in [`ConversationStore::apply`]. Updates are keyed by
//! message id, never by the active window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::{ChatBackend, ModelCatalog, ModelSource};
use crate::messages::{Message, MessageId};
use crate::protocol::{MetaEvent, StreamEvent};
use crate::selection::ModelSelection;
use crate::session::{SessionConfig, SessionId, StreamCallbacks, StreamSession};

// ============================================================================
// Core Types
// ============================================================================

/// Unique identifier for a conversation window
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowId(pub Uuid);

impl WindowId {
    /// Create a new unique window ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WindowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Title of the n-th window created (1-based)
#[must_use]
pub fn window_title(n: usize) -> String {
    format!("对话窗口 {n}")
}

/// One independent conversation thread
#[derive(Clone, Debug)]
pub struct ConversationWindow {
    /// Unique window ID
    pub id: WindowId,
    /// Display label
    pub title: String,
    /// When the window was created
    pub created_at: DateTime<Utc>,
    messages: Vec<Message>,
    busy: bool,
    session: Option<SessionId>,
}

impl ConversationWindow {
    /// Create an empty window
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: WindowId::new(),
            title: title.into(),
            created_at: Utc::now(),
            messages: Vec::new(),
            busy: false,
            session: None,
        }
    }

    /// Messages in insertion order
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Look up a message by id
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }

    /// Whether a generation is in flight
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// The in-flight session, if any
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }
}

/// One session event, addressed to its window and message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamUpdate {
    /// Window the session was opened for
    pub window_id: WindowId,
    /// Assistant message the session writes to
    pub message_id: MessageId,
    /// Session that produced the event
    pub session_id: SessionId,
    /// The event itself
    pub event: StreamEvent,
}

/// Why a send was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// No model is selected
    #[error("no model selected")]
    NoModelSelected,
    /// The window does not exist (or was removed)
    #[error("unknown conversation window {0}")]
    UnknownWindow(WindowId),
    /// The window already has a generation in flight
    #[error("conversation window {0} is still streaming")]
    WindowBusy(WindowId),
    /// The query is empty after trimming
    #[error("empty query")]
    EmptyQuery,
}

/// Callbacks that tag events and forward them to the store
struct WindowCallbacks {
    tx: mpsc::UnboundedSender<StreamUpdate>,
    window_id: WindowId,
    message_id: MessageId,
    session_id: SessionId,
}

impl WindowCallbacks {
    fn forward(&self, event: StreamEvent) {
        let _ = self.tx.send(StreamUpdate {
            window_id: self.window_id,
            message_id: self.message_id.clone(),
            session_id: self.session_id.clone(),
            event,
        });
    }
}

impl StreamCallbacks for WindowCallbacks {
    fn on_meta(&mut self, meta: MetaEvent) {
        self.forward(StreamEvent::Meta(meta));
    }

    fn on_delta(&mut self, text: String) {
        self.forward(StreamEvent::Delta { text });
    }

    fn on_error(&mut self, message: String) {
        self.forward(StreamEvent::Error { message });
    }

    fn on_done(&mut self) {
        self.forward(StreamEvent::Done);
    }
}

// ============================================================================
// Conversation Store
// ============================================================================

/// Owner of every conversation window
pub struct ConversationStore {
    backend: Arc<dyn ChatBackend>,
    session_config: SessionConfig,
    selection: ModelSelection,
    catalog: ModelCatalog,
    /// Windows in creation order
    windows: Vec<ConversationWindow>,
    active: Option<WindowId>,
    /// Windows created so far (drives titles)
    created: usize,
    /// Spawned session per window
    tasks: HashMap<WindowId, JoinHandle<()>>,
    updates_tx: mpsc::UnboundedSender<StreamUpdate>,
    updates_rx: mpsc::UnboundedReceiver<StreamUpdate>,
}

impl ConversationStore {
    /// Create a store with one default window, already active
    #[must_use]
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        selection: ModelSelection,
        session_config: SessionConfig,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let mut store = Self {
            backend,
            session_config,
            selection,
            catalog: ModelCatalog::default(),
            windows: Vec::new(),
            active: None,
            created: 0,
            tasks: HashMap::new(),
            updates_tx,
            updates_rx,
        };
        store.new_window();
        store
    }

    /// Create a window and make it active
    pub fn new_window(&mut self) -> WindowId {
        self.created += 1;
        let window = ConversationWindow::new(window_title(self.created));
        let id = window.id;
        tracing::debug!(window = %id, title = %window.title, "Conversation window created");
        self.windows.push(window);
        self.active = Some(id);
        id
    }

    /// Switch the active window (allowed mid-stream)
    ///
    /// Returns false if the window does not exist.
    pub fn set_active(&mut self, id: WindowId) -> bool {
        if self.window(id).is_some() {
            self.active = Some(id);
            true
        } else {
            false
        }
    }

    /// Remove a window, cancelling its in-flight session
    ///
    /// Returns false if the window does not exist.
    pub fn remove_window(&mut self, id: WindowId) -> bool {
        let Some(index) = self.windows.iter().position(|w| w.id == id) else {
            return false;
        };
        self.windows.remove(index);

        if let Some(task) = self.tasks.remove(&id) {
            task.abort();
            tracing::debug!(window = %id, "Cancelled session of removed window");
        }

        if self.active == Some(id) {
            self.active = self.windows.last().map(|w| w.id);
        }
        true
    }

    /// Windows in creation order
    #[must_use]
    pub fn windows(&self) -> &[ConversationWindow] {
        &self.windows
    }

    /// Look up a window
    #[must_use]
    pub fn window(&self, id: WindowId) -> Option<&ConversationWindow> {
        self.windows.iter().find(|w| w.id == id)
    }

    /// The active window ID
    #[must_use]
    pub fn active_id(&self) -> Option<WindowId> {
        self.active
    }

    /// The active window
    #[must_use]
    pub fn active_window(&self) -> Option<&ConversationWindow> {
        self.active.and_then(|id| self.window(id))
    }

    /// Whether any window is streaming
    #[must_use]
    pub fn any_busy(&self) -> bool {
        self.windows.iter().any(ConversationWindow::is_busy)
    }

    /// Current model selection
    #[must_use]
    pub fn selection(&self) -> &ModelSelection {
        &self.selection
    }

    /// Mutable model selection (credentials, explicit model)
    pub fn selection_mut(&mut self) -> &mut ModelSelection {
        &mut self.selection
    }

    /// Last fetched model catalog
    #[must_use]
    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// The backend sessions are opened against
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    /// Fetch the model catalog and fill in a default model
    pub async fn refresh_models(&mut self) -> &ModelCatalog {
        self.catalog = self.backend.models_or_empty().await;
        self.selection.apply_catalog(&self.catalog);
        &self.catalog
    }

    /// Switch model source, selecting its first catalog model
    pub fn set_model_source(&mut self, source: ModelSource) {
        self.selection.set_source(source, &self.catalog);
    }

    /// Send a query from a window
    ///
    /// Appends the user message and an assistant placeholder, marks the
    /// window busy and spawns a [`StreamSession`] for the placeholder. Must be
    /// called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Rejects the send, leaving the window untouched, if no model is
    /// selected, the window does not exist, it is busy, or `text` is blank.
    pub fn send(&mut self, window_id: WindowId, text: &str) -> Result<MessageId, SendError> {
        let query = text.trim();
        let request = self
            .selection
            .request_for(query)
            .ok_or(SendError::NoModelSelected)?;

        let window = self
            .windows
            .iter_mut()
            .find(|w| w.id == window_id)
            .ok_or(SendError::UnknownWindow(window_id))?;
        if window.busy {
            return Err(SendError::WindowBusy(window_id));
        }
        if query.is_empty() {
            return Err(SendError::EmptyQuery);
        }

        let placeholder = Message::assistant_placeholder();
        let message_id = placeholder.id.clone();
        window.messages.push(Message::user(query));
        window.messages.push(placeholder);
        window.busy = true;

        let mut session = StreamSession::new(
            Arc::clone(&self.backend),
            request,
            self.session_config.clone(),
        );
        let session_id = session.id().clone();
        window.session = Some(session_id.clone());

        let mut callbacks = WindowCallbacks {
            tx: self.updates_tx.clone(),
            window_id,
            message_id: message_id.clone(),
            session_id: session_id.clone(),
        };

        tracing::debug!(
            window = %window_id,
            message = %message_id,
            session = %session_id,
            model = %session.request().model_name,
            source = %session.request().model_source,
            "Spawning answer session"
        );
        let task = tokio::spawn(async move {
            session.run(&mut callbacks).await;
        });
        self.tasks.insert(window_id, task);

        Ok(message_id)
    }

    /// Send a query from the active window
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send). With no window left this is
    /// [`SendError::UnknownWindow`] for a fresh id.
    pub fn send_active(&mut self, text: &str) -> Result<MessageId, SendError> {
        let id = self.active.unwrap_or_default();
        self.send(id, text)
    }

    /// Apply one update
    ///
    /// Returns false if the update was dropped because its window or message
    /// no longer exists.
    pub fn apply(&mut self, update: StreamUpdate) -> bool {
        let Some(window) = self.windows.iter_mut().find(|w| w.id == update.window_id) else {
            tracing::debug!(
                window = %update.window_id,
                message = %update.message_id,
                "Dropping update for removed window"
            );
            return false;
        };

        if update.event.is_terminal() {
            if let Some(message) = window.message_mut(&update.message_id) {
                message.finalize();
            }
            if window.session.as_ref() == Some(&update.session_id) {
                window.busy = false;
                window.session = None;
                self.tasks.remove(&update.window_id);
                tracing::debug!(
                    window = %update.window_id,
                    message = %update.message_id,
                    "Answer session finished"
                );
            }
            return true;
        }

        let Some(message) = window.message_mut(&update.message_id) else {
            tracing::debug!(message = %update.message_id, "Dropping update for unknown message");
            return false;
        };
        match update.event {
            StreamEvent::Meta(meta) => message.apply_meta(meta.into()),
            StreamEvent::Delta { text } => message.apply_delta(&text),
            StreamEvent::Error { message: text } => message.apply_error(text),
            StreamEvent::Done => {}
        }
        true
    }

    /// Wait for the next update, apply it, and hand it back
    ///
    /// Pends forever while nothing is streaming.
    pub async fn pump(&mut self) -> Option<StreamUpdate> {
        let update = self.updates_rx.recv().await?;
        self.apply(update.clone());
        Some(update)
    }

    /// Apply every update already queued, without waiting
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.updates_rx.try_recv() {
            self.apply(update);
            applied += 1;
        }
        applied
    }

    /// Pump until no window is busy
    pub async fn run_until_idle(&mut self) {
        while self.any_busy() {
            if self.pump().await.is_none() {
                break;
            }
        }
    }
}

impl Drop for ConversationStore {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("backend", &self.backend.name())
            .field("windows", &self.windows.len())
            .field("active", &self.active)
            .field("selection", &self.selection)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::messages::{MessageMetadata, MessageRole, EMPTY_REPLY_TEXT, PLACEHOLDER_TEXT};
    use pretty_assertions::assert_eq;

    fn store_with(backend: &Arc<ScriptedBackend>) -> ConversationStore {
        let backend: Arc<dyn ChatBackend> = backend.clone();
        ConversationStore::new(
            backend,
            ModelSelection::new(ModelSource::Local, "qwen2.5:7b"),
            SessionConfig::default(),
        )
    }

    /// A store whose first window has a pending placeholder
    ///
    /// Nothing is pumped, so the session's own updates never get applied.
    fn pending_store() -> (ConversationStore, WindowId, MessageId, SessionId) {
        let backend = Arc::new(ScriptedBackend::new());
        let mut store = store_with(&backend);
        let window = store.active_id().unwrap();
        let message = store.send(window, "感冒了怎么办").unwrap();
        let session = store.window(window).unwrap().session_id().unwrap().clone();
        (store, window, message, session)
    }

    fn update(
        window_id: WindowId,
        message_id: &MessageId,
        session_id: &SessionId,
        event: StreamEvent,
    ) -> StreamUpdate {
        StreamUpdate {
            window_id,
            message_id: message_id.clone(),
            session_id: session_id.clone(),
            event,
        }
    }

    #[tokio::test]
    async fn test_starts_with_default_window() {
        let store = store_with(&Arc::new(ScriptedBackend::new()));
        assert_eq!(store.windows().len(), 1);
        let window = store.active_window().unwrap();
        assert_eq!(window.title, "对话窗口 1");
        assert!(!window.is_busy());
        assert!(window.messages().is_empty());
    }

    #[tokio::test]
    async fn test_window_titles_and_activation() {
        let mut store = store_with(&Arc::new(ScriptedBackend::new()));
        let first = store.active_id().unwrap();
        let second = store.new_window();
        assert_eq!(store.active_id(), Some(second));
        assert_eq!(store.window(second).unwrap().title, "对话窗口 2");

        assert!(store.set_active(first));
        assert!(store.remove_window(second));
        assert!(!store.set_active(second));

        let third = store.new_window();
        assert_eq!(store.window(third).unwrap().title, "对话窗口 3");

        assert!(store.remove_window(third));
        assert_eq!(store.active_id(), Some(first));
    }

    #[tokio::test]
    async fn test_send_appends_user_and_placeholder() {
        let (store, window, message, _) = pending_store();
        let window = store.window(window).unwrap();

        assert!(window.is_busy());
        assert_eq!(window.messages().len(), 2);
        assert_eq!(window.messages()[0].role, MessageRole::User);
        assert_eq!(window.messages()[0].content, "感冒了怎么办");
        assert_eq!(window.messages()[1].id, message);
        assert_eq!(window.messages()[1].role, MessageRole::Assistant);
        assert_eq!(window.messages()[1].content, PLACEHOLDER_TEXT);
    }

    #[tokio::test]
    async fn test_send_rejections() {
        let backend = Arc::new(ScriptedBackend::new());
        let mut store = ConversationStore::new(
            backend.clone(),
            ModelSelection::default(),
            SessionConfig::default(),
        );
        let window = store.active_id().unwrap();
        assert_eq!(store.send(window, "q"), Err(SendError::NoModelSelected));
        assert!(store.window(window).unwrap().messages().is_empty());

        store.selection_mut().model_name = Some("qwen2.5:7b".to_string());
        assert_eq!(store.send(window, "   "), Err(SendError::EmptyQuery));

        let ghost = WindowId::new();
        assert_eq!(store.send(ghost, "q"), Err(SendError::UnknownWindow(ghost)));
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_busy_window_rejects_second_send() {
        let (mut store, window, _, _) = pending_store();
        assert_eq!(store.send(window, "再问一次"), Err(SendError::WindowBusy(window)));
        assert_eq!(store.window(window).unwrap().messages().len(), 2);
    }

    #[tokio::test]
    async fn test_placeholder_law() {
        let (mut store, window, message, session) = pending_store();

        assert!(store.apply(update(window, &message, &session, StreamEvent::delta("A"))));
        assert_eq!(store.window(window).unwrap().message(&message).unwrap().content, "A");

        store.apply(update(window, &message, &session, StreamEvent::delta("B")));
        assert_eq!(store.window(window).unwrap().message(&message).unwrap().content, "AB");
    }

    #[tokio::test]
    async fn test_meta_and_error_application() {
        let (mut store, window, message, session) = pending_store();

        store.apply(update(
            window,
            &message,
            &session,
            StreamEvent::Meta(MetaEvent {
                intent: "symptom_query".to_string(),
                ..MetaEvent::default()
            }),
        ));
        store.apply(update(window, &message, &session, StreamEvent::delta("部分内容")));
        store.apply(update(window, &message, &session, StreamEvent::error("生成失败")));

        let msg = store.window(window).unwrap().message(&message).unwrap();
        assert_eq!(msg.content, "生成失败");
        assert_eq!(
            msg.metadata,
            Some(MessageMetadata {
                intent: "symptom_query".to_string(),
                ..MessageMetadata::default()
            })
        );
        // Error alone does not end the session
        assert!(store.window(window).unwrap().is_busy());
    }

    #[tokio::test]
    async fn test_done_clears_busy_only_for_current_session() {
        let (mut store, window, message, session) = pending_store();

        let stale = SessionId::new();
        store.apply(update(window, &message, &stale, StreamEvent::Done));
        assert!(store.window(window).unwrap().is_busy());

        store.apply(update(window, &message, &session, StreamEvent::Done));
        let w = store.window(window).unwrap();
        assert!(!w.is_busy());
        assert!(w.session_id().is_none());
        assert!(store.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_done_without_text_leaves_placeholder_state() {
        let (mut store, window, message, session) = pending_store();
        store.apply(update(window, &message, &session, StreamEvent::Done));
        assert_eq!(
            store.window(window).unwrap().message(&message).unwrap().content,
            EMPTY_REPLY_TEXT
        );
    }

    #[tokio::test]
    async fn test_updates_for_removed_window_are_dropped() {
        let (mut store, window, message, session) = pending_store();
        assert!(store.remove_window(window));
        assert!(store.tasks.is_empty());

        assert!(!store.apply(update(window, &message, &session, StreamEvent::delta("迟到"))));
        assert!(!store.apply(update(window, &message, &session, StreamEvent::Done)));
        assert!(store.active_id().is_none());
        assert!(matches!(store.send_active("q"), Err(SendError::UnknownWindow(_))));
    }

    #[tokio::test]
    async fn test_full_round_trip_through_session() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_lines(&[
            r#"{"type":"delta","content":"多休息"}"#,
            r#"{"type":"delta","content":"，多喝水"}"#,
            r#"{"type":"done"}"#,
        ]);
        let mut store = store_with(&backend);
        let message = store.send_active("感冒了怎么办").unwrap();

        store.run_until_idle().await;

        let window = store.active_window().unwrap();
        assert!(!window.is_busy());
        assert_eq!(window.message(&message).unwrap().content, "多休息，多喝水");
        assert_eq!(backend.requests()[0].query, "感冒了怎么办");
        assert_eq!(store.drain(), 0);
    }

    #[tokio::test]
    async fn test_refresh_models_selects_default() {
        let backend = Arc::new(ScriptedBackend::new().with_catalog(ModelCatalog {
            local: vec![],
            siliconflow: vec!["Qwen/Qwen2.5-7B-Instruct".to_string()],
        }));
        let mut store = ConversationStore::new(
            backend,
            ModelSelection::default(),
            SessionConfig::default(),
        );

        store.refresh_models().await;
        assert_eq!(store.selection().source, ModelSource::Siliconflow);
        assert!(store.selection().is_ready());

        store.set_model_source(ModelSource::Local);
        assert!(!store.selection().is_ready());
    }
}
