//! Response framing
//!
//! The adapter ends every response with a `>` prompt. Inbound chunks are
//! buffered until the prompt shows up, then everything before it is handed
//! off as one response.

use super::{MAX_RESPONSE_SIZE, RESPONSE_TERMINATOR};

/// Accumulates inbound bytes and splits them on the prompt character
#[derive(Debug, Default)]
pub struct ResponseFramer {
    buffer: Vec<u8>,
}

impl ResponseFramer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }

    /// Append a chunk and return every response completed by it, oldest first.
    ///
    /// Bytes after the last prompt stay buffered for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut responses = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == RESPONSE_TERMINATOR) {
            let frame: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&frame[..pos]).trim().to_string();
            responses.push(text);
        }

        if self.buffer.len() > MAX_RESPONSE_SIZE {
            tracing::warn!(
                "Response buffer exceeded {} bytes without a prompt, discarding",
                MAX_RESPONSE_SIZE
            );
            self.buffer.clear();
        }

        responses
    }

    /// Bytes received since the last prompt
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial response
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
