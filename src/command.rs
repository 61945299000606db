//! Command records.
//!
//! A [`Command`] is the inert value that travels through the pipeline: the
//! lowercase name, the normalized argument list, a single-shot completion
//! sink, and an optional pre-write hook. It is created by `send_command`,
//! mutated only inside the pipeline, and destroyed when its sink fires.

use crate::error::Result;
use crate::resp::types::RespValue;
use bytes::Bytes;
use tokio::sync::oneshot;

/// Text arguments longer than this are promoted to binary buffers before
/// serialization, so the writer takes the fragment-preserving path instead
/// of building one giant string.
pub const TEXT_PROMOTION_LIMIT: usize = 30_000;

/// One normalized command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArg {
    Text(String),
    Binary(Bytes),
}

impl CommandArg {
    /// Byte length on the wire (UTF-8 bytes for text, not chars).
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lossy text rendering, used for error context.
    pub fn to_display(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Binary(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }
}

impl From<&str> for CommandArg {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for CommandArg {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Bytes> for CommandArg {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

impl From<Vec<u8>> for CommandArg {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(b))
    }
}

impl From<&[u8]> for CommandArg {
    fn from(b: &[u8]) -> Self {
        Self::Binary(Bytes::copy_from_slice(b))
    }
}

impl From<i64> for CommandArg {
    fn from(n: i64) -> Self {
        Self::Text(n.to_string())
    }
}

impl From<u64> for CommandArg {
    fn from(n: u64) -> Self {
        Self::Text(n.to_string())
    }
}

impl From<f64> for CommandArg {
    fn from(n: f64) -> Self {
        Self::Text(n.to_string())
    }
}

// ── Completion sinks ───────────────────────────────────────────────

/// Callback form of a completion sink.
pub type Callback = Box<dyn FnOnce(Result<RespValue>) + Send + 'static>;

/// Where a command's result goes. Single-shot: completing the sink
/// consumes it, so a command can never be completed twice.
pub enum ResponseSink {
    /// Resolves a [`CommandFuture`](crate::client::CommandFuture).
    Channel(oneshot::Sender<Result<RespValue>>),
    /// Invokes a user callback.
    Callback(Callback),
}

impl ResponseSink {
    pub fn complete(self, result: Result<RespValue>) {
        match self {
            // The receiver may have been dropped; nothing to deliver then.
            Self::Channel(tx) => {
                let _ = tx.send(result);
            }
            Self::Callback(cb) => cb(result),
        }
    }
}

impl std::fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(_) => f.write_str("ResponseSink::Channel"),
            Self::Callback(_) => f.write_str("ResponseSink::Callback"),
        }
    }
}

// ── Pre-write hooks ────────────────────────────────────────────────

/// Reply suppression state driven by `CLIENT REPLY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Normal operation: every command gets a reply.
    On,
    /// No replies at all until `CLIENT REPLY ON`.
    Off,
    /// The `CLIENT REPLY SKIP` command itself is unreplied.
    Skip,
    /// One further command is unreplied, then back to [`ReplyMode::On`].
    SkipOneMore,
}

/// Controller mutations fired synchronously between "bytes committed to the
/// transport" and "the next command serializes".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnWrite {
    /// `CLIENT REPLY ON|OFF|SKIP` flips the reply mode.
    SetReplyMode(ReplyMode),
    /// A subscribe-family command arms pub/sub entry counting.
    EnterSubscriber,
    /// `MONITOR` switches the connection into monitor mode.
    SetMonitoring,
}

// ── Internal command markers ───────────────────────────────────────

/// Commands the controller issues on its own behalf during handshake and
/// reconnection. Their replies are consumed by the controller instead of a
/// user sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Internal {
    Auth,
    ReadyInfo,
    SelectDb(u16),
    Monitor,
    Resubscribe,
    Quit,
}

// ── Command ────────────────────────────────────────────────────────

/// An in-pipeline command.
#[derive(Debug)]
pub struct Command {
    /// Lowercase command token. The wire token may differ when a rename
    /// map is configured.
    pub name: String,
    pub args: Vec<CommandArg>,
    pub sink: Option<ResponseSink>,
    pub on_write: Option<OnWrite>,
    /// Set during normalization when any argument is binary.
    pub buffer_args: bool,
    /// Remaining subscribe-family acknowledgements, initialized lazily on
    /// the first ack for this command.
    pub sub_commands_left: Option<usize>,
    pub internal: Option<Internal>,
}

impl Command {
    /// Build a command, normalizing arguments: text longer than
    /// [`TEXT_PROMOTION_LIMIT`] bytes is promoted to a binary buffer, and
    /// `buffer_args` records whether any argument ended up binary.
    pub fn new(name: &str, args: Vec<CommandArg>) -> Self {
        let mut buffer_args = false;
        let args: Vec<CommandArg> = args
            .into_iter()
            .map(|arg| match arg {
                CommandArg::Text(s) if s.len() > TEXT_PROMOTION_LIMIT => {
                    buffer_args = true;
                    CommandArg::Binary(Bytes::from(s.into_bytes()))
                }
                CommandArg::Binary(b) => {
                    buffer_args = true;
                    CommandArg::Binary(b)
                }
                text => text,
            })
            .collect();

        Self {
            name: name.to_ascii_lowercase(),
            args,
            sink: None,
            on_write: None,
            buffer_args,
            sub_commands_left: None,
            internal: None,
        }
    }

    pub fn with_sink(mut self, sink: ResponseSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_internal(mut self, internal: Internal) -> Self {
        self.internal = Some(internal);
        self
    }

    /// Lossy argument rendering for error context.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args.iter().map(|a| a.to_display()).collect()
    }

    /// Complete this command's sink, if one is attached.
    pub fn complete(&mut self, result: Result<RespValue>) {
        if let Some(sink) = self.sink.take() {
            sink.complete(result);
        }
    }

    /// Prefix the arguments selected by `is_key` with `prefix`.
    pub fn apply_prefix(&mut self, prefix: &str, is_key: impl Fn(&str, usize) -> bool) {
        for (idx, arg) in self.args.iter_mut().enumerate() {
            if !is_key(&self.name, idx) {
                continue;
            }
            match arg {
                CommandArg::Text(s) => {
                    s.insert_str(0, prefix);
                }
                CommandArg::Binary(b) => {
                    let mut prefixed = Vec::with_capacity(prefix.len() + b.len());
                    prefixed.extend_from_slice(prefix.as_bytes());
                    prefixed.extend_from_slice(b);
                    *b = Bytes::from(prefixed);
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Normalization ──

    #[test]
    fn text_at_limit_stays_text() {
        let arg = CommandArg::Text("x".repeat(TEXT_PROMOTION_LIMIT));
        let cmd = Command::new("set", vec!["key".into(), arg]);
        assert!(matches!(cmd.args[1], CommandArg::Text(_)));
        assert!(!cmd.buffer_args);
    }

    #[test]
    fn text_over_limit_promoted() {
        let arg = CommandArg::Text("x".repeat(TEXT_PROMOTION_LIMIT + 1));
        let cmd = Command::new("set", vec!["key".into(), arg]);
        assert!(matches!(cmd.args[1], CommandArg::Binary(_)));
        assert!(cmd.buffer_args);
        assert_eq!(cmd.args[1].len(), TEXT_PROMOTION_LIMIT + 1);
    }

    #[test]
    fn binary_arg_sets_buffer_args() {
        let cmd = Command::new(
            "set",
            vec!["key".into(), CommandArg::Binary(Bytes::from_static(b"\x00\x01"))],
        );
        assert!(cmd.buffer_args);
    }

    #[test]
    fn text_only_clears_buffer_args() {
        let cmd = Command::new("get", vec!["key".into()]);
        assert!(!cmd.buffer_args);
    }

    #[test]
    fn name_lowercased() {
        let cmd = Command::new("HGETALL", vec!["h".into()]);
        assert_eq!(cmd.name, "hgetall");
    }

    #[test]
    fn numeric_args_format_as_decimal_text() {
        assert_eq!(CommandArg::from(42i64), CommandArg::Text("42".into()));
        assert_eq!(CommandArg::from(7u64), CommandArg::Text("7".into()));
        assert_eq!(CommandArg::from(1.5f64), CommandArg::Text("1.5".into()));
        assert_eq!(CommandArg::from(-3i64), CommandArg::Text("-3".into()));
    }

    #[test]
    fn arg_len_is_byte_length() {
        // Multi-byte UTF-8: 3 chars, 7 bytes.
        let arg = CommandArg::Text("aéé".into());
        assert_eq!(arg.len(), 5);
    }

    // ── Sinks ──

    #[test]
    fn callback_sink_fires_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let mut cmd = Command::new("ping", vec![]).with_sink(ResponseSink::Callback(Box::new(
            move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
        )));
        cmd.complete(Ok(RespValue::SimpleString("PONG".into())));
        // Second complete is a no-op — the sink is gone.
        cmd.complete(Ok(RespValue::SimpleString("PONG".into())));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_sink_resolves_receiver() {
        let (tx, rx) = oneshot::channel();
        let mut cmd = Command::new("get", vec!["k".into()]).with_sink(ResponseSink::Channel(tx));
        cmd.complete(Ok(RespValue::Null));
        assert_eq!(rx.await.unwrap().unwrap(), RespValue::Null);
    }

    #[test]
    fn channel_sink_tolerates_dropped_receiver() {
        let (tx, rx) = oneshot::channel();
        drop(rx);
        let mut cmd = Command::new("get", vec!["k".into()]).with_sink(ResponseSink::Channel(tx));
        cmd.complete(Ok(RespValue::Null));
    }

    // ── Prefixing ──

    #[test]
    fn prefix_applied_to_key_positions() {
        let mut cmd = Command::new("set", vec!["foo".into(), "bar".into()]);
        cmd.apply_prefix("app:", |_, idx| idx == 0);
        assert_eq!(cmd.args[0], CommandArg::Text("app:foo".into()));
        assert_eq!(cmd.args[1], CommandArg::Text("bar".into()));
    }

    #[test]
    fn prefix_applied_to_binary_key() {
        let mut cmd = Command::new(
            "set",
            vec![CommandArg::Binary(Bytes::from_static(b"foo")), "bar".into()],
        );
        cmd.apply_prefix("app:", |_, idx| idx == 0);
        assert_eq!(cmd.args[0], CommandArg::Binary(Bytes::from_static(b"app:foo")));
    }

    #[test]
    fn arg_strings_render_binary_lossily() {
        let cmd = Command::new(
            "set",
            vec!["k".into(), CommandArg::Binary(Bytes::from_static(b"ok"))],
        );
        assert_eq!(cmd.arg_strings(), vec!["k".to_string(), "ok".to_string()]);
    }
}
