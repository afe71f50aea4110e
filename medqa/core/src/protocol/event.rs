//! Event Decoder
//!
//! Parses one frame into a typed [`StreamEvent`].
//!
//! # Wire Format
//!
//! ```text
//! {"type":"meta","intent":"...","entities":{"疾病":"流感"},"prompt":"...","knowledge":"..."}
//! {"type":"delta","content":"..."}
//! {"type":"error","message":"..."}
//! {"type":"done"}
//! ```
//!
//! Missing or `null` payload fields fall back to defaults. Anything else
//! (unknown `type`, not JSON, wrongly typed fields) is a [`DecodeFailure`],
//! which callers log and skip.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::messages::GENERATION_FAILED_TEXT;

/// Payload of a `meta` event
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetaEvent {
    /// Entity type to extracted value
    pub entities: BTreeMap<String, String>,
    /// Recognized intent label
    pub intent: String,
    /// Prompt the service built
    pub prompt: String,
    /// Knowledge retrieved for the prompt
    pub knowledge: String,
}

/// One decoded protocol event
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Analysis results, sent before any text
    Meta(MetaEvent),
    /// A fragment of generated text
    Delta {
        /// The text fragment
        #[serde(rename = "content")]
        text: String,
    },
    /// Remote generation failure
    Error {
        /// Readable failure description
        message: String,
    },
    /// End of the answer
    Done,
}

impl StreamEvent {
    /// Build a delta event
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    /// Build an error event
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Whether this event ends a stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Encode as one newline-terminated wire line
    ///
    /// # Errors
    ///
    /// Returns the serde error if the event cannot be encoded.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Why a frame could not be decoded
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeFailureReason {
    /// The frame is not JSON
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// The frame is JSON but not an object
    #[error("not a JSON object")]
    NotAnObject,
    /// No string `type` field
    #[error("missing `type` discriminator")]
    MissingType,
    /// A `type` this client does not know
    #[error("unknown event type `{0}`")]
    UnknownType(String),
    /// A known `type` with wrongly typed fields
    #[error("invalid `{kind}` payload: {detail}")]
    InvalidPayload {
        /// The event type
        kind: String,
        /// The serde error
        detail: String,
    },
}

/// A frame that is not a valid protocol event
///
/// Produced locally, never sent by the service, never fatal.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("undecodable stream line ({reason}): {raw_line}")]
pub struct DecodeFailure {
    /// The frame as received
    pub raw_line: String,
    /// What was wrong with it
    pub reason: DecodeFailureReason,
}

impl DecodeFailure {
    fn new(raw_line: &str, reason: DecodeFailureReason) -> Self {
        Self {
            raw_line: raw_line.to_string(),
            reason,
        }
    }
}

#[derive(Deserialize)]
struct WireMeta {
    intent: Option<String>,
    entities: Option<BTreeMap<String, String>>,
    prompt: Option<String>,
    knowledge: Option<String>,
}

#[derive(Deserialize)]
struct WireDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireError {
    message: Option<String>,
}

/// Decode one frame
///
/// # Errors
///
/// Returns a [`DecodeFailure`] for anything that is not a recognized event.
pub fn decode_line(line: &str) -> Result<StreamEvent, DecodeFailure> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| DecodeFailure::new(line, DecodeFailureReason::InvalidJson(e.to_string())))?;

    let kind = match &value {
        Value::Object(map) => match map.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(DecodeFailure::new(line, DecodeFailureReason::MissingType)),
        },
        _ => return Err(DecodeFailure::new(line, DecodeFailureReason::NotAnObject)),
    };

    let invalid = |e: serde_json::Error| {
        DecodeFailure::new(
            line,
            DecodeFailureReason::InvalidPayload {
                kind: kind.clone(),
                detail: e.to_string(),
            },
        )
    };

    match kind.as_str() {
        "meta" => {
            let wire: WireMeta = serde_json::from_value(value).map_err(invalid)?;
            Ok(StreamEvent::Meta(MetaEvent {
                entities: wire.entities.unwrap_or_default(),
                intent: wire.intent.unwrap_or_default(),
                prompt: wire.prompt.unwrap_or_default(),
                knowledge: wire.knowledge.unwrap_or_default(),
            }))
        }
        "delta" => {
            let wire: WireDelta = serde_json::from_value(value).map_err(invalid)?;
            Ok(StreamEvent::Delta {
                text: wire.content.unwrap_or_default(),
            })
        }
        "error" => {
            let wire: WireError = serde_json::from_value(value).map_err(invalid)?;
            Ok(StreamEvent::Error {
                message: wire
                    .message
                    .unwrap_or_else(|| GENERATION_FAILED_TEXT.to_string()),
            })
        }
        "done" => Ok(StreamEvent::Done),
        _ => Err(DecodeFailure::new(
            line,
            DecodeFailureReason::UnknownType(kind.clone()),
        )),
    }
}
