//! Frame Splitter
//!
//! Turns an arbitrarily chunked byte stream into complete text lines.
//!
//! # Framing
//!
//! ```text
//! chunk 1: {"type":"delta","content":"发   (chunk ends inside a 3-byte char)
//! chunk 2: 热"}\n{"type":"do
//! chunk 3: ne"}\n
//!
//! frames:  {"type":"delta","content":"发热"}
//!          {"type":"done"}
//! ```
//!
//! Chunk boundaries carry no meaning. UTF-8 is decoded incrementally, so a
//! character split across chunks is reassembled instead of being replaced.
//! Invalid byte sequences decode to U+FFFD. Lines are trimmed and blank lines
//! are skipped.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Minimum buffer capacity for the line buffer
const MIN_BUFFER_CAPACITY: usize = 4096;

/// What to do with an unterminated line when the stream ends
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailingLinePolicy {
    /// Drop it (the service always terminates lines it means to send)
    #[default]
    Discard,
    /// Yield it as a final frame
    Emit,
}

impl FromStr for TrailingLinePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "discard" => Ok(Self::Discard),
            "emit" => Ok(Self::Emit),
            other => Err(format!("unknown trailing line policy `{other}`")),
        }
    }
}

impl std::fmt::Display for TrailingLinePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discard => write!(f, "discard"),
            Self::Emit => write!(f, "emit"),
        }
    }
}

/// Incremental newline splitter with stateful UTF-8 decoding
#[derive(Debug)]
pub struct FrameSplitter {
    policy: TrailingLinePolicy,
    /// Undecoded bytes (an incomplete UTF-8 sequence at most)
    pending: Vec<u8>,
    /// Decoded text not yet terminated by `\n`
    buffer: String,
}

impl Default for FrameSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSplitter {
    /// Create a splitter that discards a trailing partial line
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(TrailingLinePolicy::default())
    }

    /// Create a splitter with an explicit trailing line policy
    #[must_use]
    pub fn with_policy(policy: TrailingLinePolicy) -> Self {
        Self {
            policy,
            pending: Vec::with_capacity(4),
            buffer: String::with_capacity(MIN_BUFFER_CAPACITY),
        }
    }

    /// Bytes received but not yet part of a complete frame
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.pending.len()
    }

    /// Feed one chunk and collect every frame it completes, in order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        decode_utf8(&mut self.pending, chunk, &mut self.buffer);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Signal end of stream
    ///
    /// Returns the unterminated remainder only under [`TrailingLinePolicy::Emit`].
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            self.buffer
                .push_str(&String::from_utf8_lossy(&std::mem::take(&mut self.pending)));
        }
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            return None;
        }

        match self.policy {
            TrailingLinePolicy::Discard => {
                tracing::debug!(bytes = rest.len(), "Discarding unterminated trailing line");
                None
            }
            TrailingLinePolicy::Emit => Some(rest.to_string()),
        }
    }

    fn next_frame(&mut self) -> Option<String> {
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
        None
    }
}

/// Decode `chunk` (after any carried-over bytes) into `out`
///
/// An incomplete sequence at the end stays in `pending` for the next chunk.
fn decode_utf8(pending: &mut Vec<u8>, chunk: &[u8], out: &mut String) {
    pending.extend_from_slice(chunk);

    let mut start = 0;
    while start < pending.len() {
        match std::str::from_utf8(&pending[start..]) {
            Ok(text) => {
                out.push_str(text);
                start = pending.len();
            }
            Err(err) => {
                let valid_end = start + err.valid_up_to();
                if let Ok(text) = std::str::from_utf8(&pending[start..valid_end]) {
                    out.push_str(text);
                }
                match err.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        start = valid_end + len;
                    }
                    None => {
                        start = valid_end;
                        break;
                    }
                }
            }
        }
    }

    pending.drain(..start);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "{\"type\":\"meta\",\"intent\":\"symptom_query\"}\n{\"type\":\"delta\",\"content\":\"发热\"}\n\n{\"type\":\"delta\",\"content\":\"是常见症状\"}\n{\"type\":\"done\"}\n";

    fn split_all(chunks: &[&[u8]]) -> Vec<String> {
        let mut splitter = FrameSplitter::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(splitter.push(chunk));
        }
        frames.extend(splitter.finish());
        frames
    }

    fn expected() -> Vec<String> {
        SAMPLE
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_single_chunk() {
        assert_eq!(split_all(&[SAMPLE.as_bytes()]), expected());
    }

    #[test]
    fn test_every_two_way_split_yields_same_frames() {
        let bytes = SAMPLE.as_bytes();
        for cut in 0..=bytes.len() {
            let (a, b) = bytes.split_at(cut);
            assert_eq!(split_all(&[a, b]), expected(), "split at byte {cut}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = SAMPLE.as_bytes();
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(split_all(&chunks), expected());
    }

    #[test]
    fn test_uneven_chunk_sizes() {
        let bytes = SAMPLE.as_bytes();
        for size in [2, 3, 5, 7, 11] {
            let chunks: Vec<&[u8]> = bytes.chunks(size).collect();
            assert_eq!(split_all(&chunks), expected(), "chunk size {size}");
        }
    }

    #[test]
    fn test_multibyte_char_split_is_reassembled() {
        let mut splitter = FrameSplitter::new();
        let text = "流感\n".as_bytes();
        // "流" is 3 bytes; cut after its first byte
        assert!(splitter.push(&text[..1]).is_empty());
        assert!(splitter.push(&text[1..4]).is_empty());
        assert_eq!(splitter.push(&text[4..]), vec!["流感".to_string()]);
    }

    #[test]
    fn test_no_frame_before_newline() {
        let mut splitter = FrameSplitter::new();
        assert!(splitter.push(b"{\"type\":").is_empty());
        assert!(splitter.push(b"\"done\"}").is_empty());
        assert_eq!(splitter.buffered_len(), 15);
        assert_eq!(splitter.push(b"\n"), vec!["{\"type\":\"done\"}".to_string()]);
        assert_eq!(splitter.buffered_len(), 0);
    }

    #[test]
    fn test_blank_and_crlf_lines() {
        let mut splitter = FrameSplitter::new();
        let frames = splitter.push(b"\n\r\n  \na\r\nb\n");
        assert_eq!(frames, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_trailing_line_discarded_by_default() {
        let mut splitter = FrameSplitter::new();
        assert_eq!(splitter.push(b"a\nunterminated"), vec!["a".to_string()]);
        assert_eq!(splitter.finish(), None);
        assert_eq!(splitter.buffered_len(), 0);
    }

    #[test]
    fn test_trailing_line_emitted_when_configured() {
        let mut splitter = FrameSplitter::with_policy(TrailingLinePolicy::Emit);
        assert_eq!(splitter.push(b"a\n{\"type\":\"done\"}"), vec!["a".to_string()]);
        assert_eq!(splitter.finish(), Some("{\"type\":\"done\"}".to_string()));
    }

    #[test]
    fn test_blank_trailing_line_never_emitted() {
        let mut splitter = FrameSplitter::with_policy(TrailingLinePolicy::Emit);
        splitter.push(b"a\n   ");
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_invalid_bytes_become_replacement_char() {
        let mut splitter = FrameSplitter::new();
        let frames = splitter.push(b"a\xffb\n");
        assert_eq!(frames, vec!["a\u{FFFD}b".to_string()]);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("discard".parse::<TrailingLinePolicy>(), Ok(TrailingLinePolicy::Discard));
        assert_eq!(" Emit ".parse::<TrailingLinePolicy>(), Ok(TrailingLinePolicy::Emit));
        assert!("keep".parse::<TrailingLinePolicy>().is_err());
        assert_eq!(TrailingLinePolicy::Emit.to_string(), "emit");
    }
}
