//! Conversation Messages
//!
//! The message log entries owned by a conversation window, plus the fixed
//! user-visible texts the client writes into assistant messages.
//!
//! # Content Lifecycle
//!
//! ```text
//! user message:       "感冒了怎么办"                      (immutable)
//! assistant message:  PLACEHOLDER ──delta──▶ "多休息" ──delta──▶ "多休息，多喝水"
//!                          │
//!                          └──error──▶ "无法连接聊天服务"
//! ```
//!
//! The first delta replaces the placeholder, later deltas append. An error
//! replaces whatever has been streamed so far.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::MetaEvent;

/// Content of an assistant message before its first delta arrives
pub const PLACEHOLDER_TEXT: &str = "正在连接模型，请稍候...";

/// Shown when the stream could not be opened or delivered no body
pub const CONNECTION_FAILED_TEXT: &str = "无法连接聊天服务";

/// Used when an `error` event carries no `message`
pub const GENERATION_FAILED_TEXT: &str = "生成失败";

/// Prefix for transport failures raised while reading the body
pub const STREAM_READ_FAILED_PREFIX: &str = "读取数据流时发生异常: ";

/// Shown when no bytes arrive within the configured idle timeout
pub const IDLE_TIMEOUT_TEXT: &str = "等待模型响应超时";

/// Replaces the placeholder when a stream finishes without any text
pub const EMPTY_REPLY_TEXT: &str = "模型未返回任何内容";

/// Unique identifier for a message
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new unique message ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who authored a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Typed by the user
    User,
    /// Generated by the answer service
    Assistant,
}

/// Analysis attached to an assistant message by the `meta` event
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Entity type to extracted value
    pub entities: BTreeMap<String, String>,
    /// Recognized intent label
    pub intent: String,
    /// Prompt the service built for generation
    pub prompt_text: String,
    /// Knowledge retrieved from the graph
    pub retrieved_knowledge: String,
}

impl From<MetaEvent> for MessageMetadata {
    fn from(meta: MetaEvent) -> Self {
        Self {
            entities: meta.entities,
            intent: meta.intent,
            prompt_text: meta.prompt,
            retrieved_knowledge: meta.knowledge,
        }
    }
}

/// A single entry in a window's message log
#[derive(Clone, Debug)]
pub struct Message {
    /// Unique message ID
    pub id: MessageId,
    /// Who sent this message
    pub role: MessageRole,
    /// Current text
    pub content: String,
    /// Only ever set on assistant messages
    pub metadata: Option<MessageMetadata>,
    /// When the message was created
    pub created_at: DateTime<Utc>,
    /// True until the first delta or error replaces the placeholder
    pending: bool,
}

impl Message {
    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::User,
            content: content.into(),
            metadata: None,
            created_at: Utc::now(),
            pending: false,
        }
    }

    /// Create an assistant message holding the placeholder text
    #[must_use]
    pub fn assistant_placeholder() -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::Assistant,
            content: PLACEHOLDER_TEXT.to_string(),
            metadata: None,
            created_at: Utc::now(),
            pending: true,
        }
    }

    /// Whether the content is still the placeholder
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Apply a streamed text fragment
    ///
    /// Replaces the placeholder on the first call, appends afterwards.
    pub fn apply_delta(&mut self, text: &str) {
        if self.pending {
            self.content = text.to_string();
            self.pending = false;
        } else {
            self.content.push_str(text);
        }
    }

    /// Replace everything streamed so far with an error text
    pub fn apply_error(&mut self, text: impl Into<String>) {
        self.content = text.into();
        self.pending = false;
    }

    /// Attach metadata (last write wins)
    ///
    /// Ignored on user messages.
    pub fn apply_meta(&mut self, metadata: MessageMetadata) {
        if self.role == MessageRole::Assistant {
            self.metadata = Some(metadata);
        }
    }

    /// Leave the placeholder state when a stream ends with nothing to show
    pub fn finalize(&mut self) {
        if self.pending {
            self.content = EMPTY_REPLY_TEXT.to_string();
            self.pending = false;
        }
    }
}
