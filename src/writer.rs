//! RESP command serialization and the corking batcher.
//!
//! Commands serialize into [`WireFragment`]s: text-only commands become one
//! contiguous string, while binary arguments keep their own fragment so the
//! payload bytes are never copied into a header string. While corked,
//! fragments accumulate in a [`CorkBuffer`] and flush as one batch on uncork.

use crate::command::{Command, CommandArg};
use bytes::Bytes;
use itoa::Buffer;
use std::collections::VecDeque;

/// Uncorked string batches are split into writes at this boundary, so a
/// pathological batch does not become one giant allocation.
pub const STRING_WRITE_LIMIT: usize = 4 * 1024 * 1024;

/// One serialized piece of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFragment {
    Text(String),
    Binary(Bytes),
}

impl WireFragment {
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Text(s) => Bytes::from(s.into_bytes()),
            Self::Binary(b) => b,
        }
    }
}

/// Serialize a command into RESP multi-bulk fragments.
///
/// `wire_name` is the token actually sent (it differs from `cmd.name` when a
/// rename map is configured). Text arguments use their UTF-8 byte length.
/// Each binary argument produces three writes: the `$<len>\r\n` header (fused
/// onto the preceding text run), the payload verbatim, and the closing CRLF.
pub fn encode_command(cmd: &Command, wire_name: &str) -> Vec<WireFragment> {
    let mut itoa_buf = Buffer::new();
    let mut fragments = Vec::new();

    // *<argc>\r\n$<len>\r\n<name>\r\n
    let mut text = String::with_capacity(32);
    text.push('*');
    text.push_str(itoa_buf.format(cmd.args.len() + 1));
    text.push_str("\r\n$");
    text.push_str(itoa_buf.format(wire_name.len()));
    text.push_str("\r\n");
    text.push_str(wire_name);
    text.push_str("\r\n");

    for arg in &cmd.args {
        match arg {
            CommandArg::Text(s) => {
                text.push('$');
                text.push_str(itoa_buf.format(s.len()));
                text.push_str("\r\n");
                text.push_str(s);
                text.push_str("\r\n");
            }
            CommandArg::Binary(payload) => {
                // Header rides on the current text run; the payload is its
                // own write so the bytes are never copied.
                text.push('$');
                text.push_str(itoa_buf.format(payload.len()));
                text.push_str("\r\n");
                fragments.push(WireFragment::Text(std::mem::take(&mut text)));
                fragments.push(WireFragment::Binary(payload.clone()));
                text.push_str("\r\n");
            }
        }
    }

    if !text.is_empty() {
        fragments.push(WireFragment::Text(text));
    }
    fragments
}

/// Concatenate text fragments for the strings fast path, starting a new
/// chunk whenever the current one grows past [`STRING_WRITE_LIMIT`].
pub fn coalesce_text(fragments: Vec<WireFragment>) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for frag in fragments {
        match frag {
            WireFragment::Text(s) => current.push_str(&s),
            // A corked batch only takes this path when no command in it had
            // binary arguments, so this arm is unreachable in practice.
            WireFragment::Binary(b) => {
                if !current.is_empty() {
                    chunks.push(Bytes::from(std::mem::take(&mut current).into_bytes()));
                }
                chunks.push(b);
                continue;
            }
        }
        if current.len() > STRING_WRITE_LIMIT {
            chunks.push(Bytes::from(std::mem::take(&mut current).into_bytes()));
        }
    }
    if !current.is_empty() {
        chunks.push(Bytes::from(current.into_bytes()));
    }
    chunks
}

// ── Cork buffer ────────────────────────────────────────────────────

/// The pipeline batch accumulated between `cork()` and `uncork()`.
#[derive(Debug)]
pub struct CorkBuffer {
    corked: bool,
    fragments: Vec<WireFragment>,
    /// True while every command in the batch is pure text; selects the
    /// concatenating fast path on flush.
    fire_strings: bool,
}

impl CorkBuffer {
    pub fn new() -> Self {
        Self {
            corked: false,
            fragments: Vec::new(),
            fire_strings: true,
        }
    }

    pub fn is_corked(&self) -> bool {
        self.corked
    }

    pub fn cork(&mut self) {
        self.corked = true;
    }

    /// Append one command's fragments to the batch.
    pub fn push(&mut self, fragments: Vec<WireFragment>, buffer_args: bool) {
        if buffer_args {
            self.fire_strings = false;
        }
        self.fragments.extend(fragments);
    }

    /// Close the batch: returns the accumulated fragments and whether the
    /// strings fast path applies. The buffer is empty afterwards.
    pub fn uncork(&mut self) -> (Vec<WireFragment>, bool) {
        self.corked = false;
        let fire_strings = self.fire_strings;
        self.fire_strings = true;
        (std::mem::take(&mut self.fragments), fire_strings)
    }

    /// Drop any batched fragments, e.g. when the connection dies mid-cork.
    pub fn reset(&mut self) {
        self.corked = false;
        self.fire_strings = true;
        self.fragments.clear();
    }
}

// ── Outbox ─────────────────────────────────────────────────────────

/// Bytes the transport refused to accept yet. Drained when the socket
/// becomes writable again.
#[derive(Debug, Default)]
pub struct Outbox {
    chunks: VecDeque<Bytes>,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn push_back(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
    }

    pub fn front(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Consume `n` bytes from the front chunk.
    pub fn advance(&mut self, n: usize) {
        if let Some(front) = self.chunks.front_mut() {
            if n >= front.len() {
                self.chunks.pop_front();
            } else {
                let _ = front.split_to(n);
            }
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

// ── Tests ──────────────────────────────────────────────────────────
