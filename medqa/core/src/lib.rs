//! MedQA Core - Headless Streaming Client for the Medical Answer Service
//!
//! This crate holds the client logic for the medical question-answering
//! service, independent of any UI. It can drive a terminal chat, a GUI, or
//! run headless in tests.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          UI Surface                              │
//! │            send(window, text)        windows() / pump()          │
//! └───────────────────┬──────────────────────────▲───────────────────┘
//!                     │                          │
//! ┌───────────────────┼──────────────────────────┼───────────────────┐
//! │                   ▼     ConversationStore    │                   │
//! │   ┌────────────────────────┐        ┌────────┴──────────┐        │
//! │   │ windows / busy flags   │◀───────│ StreamUpdate chan │        │
//! │   └────────────────────────┘        └────────▲──────────┘        │
//! │                                              │                   │
//! │   ┌──────────────────────────────────────────┴────────────────┐  │
//! │   │ StreamSession: bytes ─▶ FrameSplitter ─▶ decode_line ─▶ cb │  │
//! │   └──────────────────────────────▲────────────────────────────┘  │
//! └──────────────────────────────────┼───────────────────────────────┘
//!                                    │ ChatBackend (HTTP / scripted)
//!                                    ▼
//!                     POST /api/chat/stream (NDJSON)
//! ```
//!
//! # Key Types
//!
//! - [`ConversationStore`]: Windows, busy flags and event reconciliation
//! - [`StreamSession`]: One request's life cycle, ending in exactly one `on_done`
//! - [`FrameSplitter`]: Byte chunks to complete lines
//! - [`decode_line`]: One line to a [`StreamEvent`] or a [`DecodeFailure`]
//! - [`ChatBackend`]: The answer service transport
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use medqa_core::{ConversationStore, HttpBackend, ModelSelection, ModelSource, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(HttpBackend::new("http://127.0.0.1:8000")?);
//!     let selection = ModelSelection::new(ModelSource::Local, "qwen2.5:7b");
//!     let mut store = ConversationStore::new(backend, selection, SessionConfig::default());
//!
//!     let message = store.send_active("感冒了怎么办")?;
//!     while let Some(update) = store.pump().await {
//!         // Render update.event for update.window_id
//!         if update.message_id == message && update.event.is_terminal() {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod conversation;
pub mod messages;
pub mod protocol;
pub mod selection;
pub mod session;

// Re-exports for convenience
pub use backend::{
    BackendError, ChatBackend, ChatRequest, GraphStatus, HttpBackend, ModelCatalog, ModelSource,
    ScriptedBackend,
};
pub use config::{load_config, ClientConfig, ConfigError, ConfigOverrides, ConfigSource};
pub use conversation::{ConversationStore, ConversationWindow, SendError, StreamUpdate, WindowId};
pub use messages::{Message, MessageId, MessageMetadata, MessageRole};
pub use protocol::{
    decode_line, DecodeFailure, DecodeFailureReason, FrameSplitter, MetaEvent, StreamEvent,
    TrailingLinePolicy,
};
pub use selection::ModelSelection;
pub use session::{
    SessionConfig, SessionId, SessionOutcome, SessionState, StreamCallbacks, StreamSession,
};
