//! Streaming Protocol
//!
//! Decoding of the answer service's newline-delimited JSON stream.
//!
//! ```text
//! bytes ──▶ FrameSplitter ──▶ lines ──▶ decode_line ──▶ StreamEvent
//!                                             └──────▶ DecodeFailure (logged, skipped)
//! ```

pub mod event;
pub mod frame;

pub use event::{decode_line, DecodeFailure, DecodeFailureReason, MetaEvent, StreamEvent};
pub use frame::{FrameSplitter, TrailingLinePolicy};
