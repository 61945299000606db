//! Error types for the client.
//!
//! Two families matter to callers: [`ClientError::Aborted`] for commands the
//! client gave up on locally (connection closed, retry budget exhausted, …)
//! and [`ClientError::Reply`] for `-` error replies the server sent back.
//! Everything else is plumbing.

use std::fmt;
use std::io;

/// Machine-readable codes attached to locally aborted commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCode {
    /// Send attempted while the connection is closing or the offline queue
    /// is disabled.
    NrClosed,
    /// The command was in flight when the connection dropped; the server may
    /// or may not have executed it.
    UncertainState,
    /// The reconnection budget is exhausted; the client has given up.
    ConnectionBroken,
    /// The reply stream is corrupt beyond recovery.
    NrFatal,
}

impl AbortCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NrClosed => "NR_CLOSED",
            Self::UncertainState => "UNCERTAIN_STATE",
            Self::ConnectionBroken => "CONNECTION_BROKEN",
            Self::NrFatal => "NR_FATAL",
        }
    }
}

impl fmt::Display for AbortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All error variants for rewire.
#[derive(Debug)]
pub enum ClientError {
    /// TCP / IO level errors.
    Connection(io::Error),
    /// RESP framing violations from the server.
    Protocol(String),
    /// RESP parser needs more data — not a real error, used as control flow.
    Incomplete,
    /// A command the client aborted before any server reply arrived.
    Aborted {
        code: AbortCode,
        message: String,
        /// Wire token of the originating command, uppercased.
        command: Option<String>,
        /// Arguments of the originating command (binary args rendered lossily).
        args: Vec<String>,
    },
    /// A `-` error reply from the server, routed to the originating command.
    Reply {
        /// Leading uppercase token of the message, e.g. `ERR` or `WRONGTYPE`.
        code: Option<String>,
        message: String,
        command: Option<String>,
        args: Vec<String>,
    },
    /// Several queued commands failed in one fatal transition.
    Aggregate(Vec<ClientError>),
}

impl ClientError {
    /// Create a local abort error with no command context yet.
    pub fn aborted(code: AbortCode, message: impl Into<String>) -> Self {
        Self::Aborted {
            code,
            message: message.into(),
            command: None,
            args: Vec::new(),
        }
    }

    /// Create a reply error from a raw server error message, extracting the
    /// leading uppercase code (`ERR`, `WRONGTYPE`, `LOADING`, …) when present.
    pub fn reply(msg: impl Into<String>) -> Self {
        let message = msg.into();
        let code = leading_code(&message);
        Self::Reply {
            code,
            message,
            command: None,
            args: Vec::new(),
        }
    }

    /// Attach the originating command context to an abort or reply error.
    pub fn with_command(mut self, name: &str, arg_strings: Vec<String>) -> Self {
        match &mut self {
            Self::Aborted { command, args, .. } | Self::Reply { command, args, .. } => {
                *command = Some(name.to_ascii_uppercase());
                *args = arg_strings;
            }
            _ => {}
        }
        self
    }

    /// The machine-readable code, if this error carries one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Aborted { code, .. } => Some(code.as_str()),
            Self::Reply { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// The human-readable message without any variant prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Connection(e) => e.to_string(),
            Self::Protocol(msg) => msg.clone(),
            Self::Incomplete => "incomplete RESP frame".into(),
            Self::Aborted { message, .. } | Self::Reply { message, .. } => message.clone(),
            Self::Aggregate(errs) => format!("{} commands aborted", errs.len()),
        }
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete)
    }
}

/// Extract the leading uppercase code of a server error message,
/// e.g. `"WRONGTYPE Operation…"` → `Some("WRONGTYPE")`.
fn leading_code(msg: &str) -> Option<String> {
    let end = msg.bytes().position(|b| !b.is_ascii_uppercase())?;
    if end == 0 || !msg.as_bytes()[end].is_ascii_whitespace() {
        return None;
    }
    Some(msg[..end].to_string())
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "connection error: {e}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Incomplete => write!(f, "incomplete RESP frame"),
            Self::Aborted {
                code,
                message,
                command,
                ..
            } => match command {
                Some(cmd) => write!(f, "{code}: {message} (command: {cmd})"),
                None => write!(f, "{code}: {message}"),
            },
            Self::Reply {
                message, command, ..
            } => match command {
                Some(cmd) => write!(f, "redis error: {message} (command: {cmd})"),
                None => write!(f, "redis error: {message}"),
            },
            Self::Aggregate(errs) => write!(f, "{} commands aborted", errs.len()),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        Self::Connection(e)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_code_err() {
        let err = ClientError::reply("ERR unknown command 'FOO'");
        assert_eq!(err.code(), Some("ERR"));
        assert_eq!(err.message(), "ERR unknown command 'FOO'");
    }

    #[test]
    fn leading_code_wrongtype() {
        let err = ClientError::reply("WRONGTYPE Operation against a key holding the wrong kind of value");
        assert_eq!(err.code(), Some("WRONGTYPE"));
    }

    #[test]
    fn leading_code_absent() {
        let err = ClientError::reply("lowercase message without a code");
        assert_eq!(err.code(), None);
    }

    #[test]
    fn leading_code_requires_space() {
        // An all-caps message with no following word is not a code.
        let err = ClientError::reply("OOM");
        assert_eq!(err.code(), None);
    }

    #[test]
    fn abort_codes_render() {
        assert_eq!(AbortCode::NrClosed.as_str(), "NR_CLOSED");
        assert_eq!(AbortCode::UncertainState.as_str(), "UNCERTAIN_STATE");
        assert_eq!(AbortCode::ConnectionBroken.as_str(), "CONNECTION_BROKEN");
        assert_eq!(AbortCode::NrFatal.as_str(), "NR_FATAL");
    }

    #[test]
    fn with_command_uppercases() {
        let err = ClientError::aborted(AbortCode::NrClosed, "The connection is already closed.")
            .with_command("get", vec!["foo".into()]);
        match &err {
            ClientError::Aborted { command, args, .. } => {
                assert_eq!(command.as_deref(), Some("GET"));
                assert_eq!(args, &["foo".to_string()]);
            }
            other => panic!("expected Aborted, got {other:?}"),
        }
        assert!(err.to_string().contains("NR_CLOSED"));
        assert!(err.to_string().contains("GET"));
    }

    #[test]
    fn display_variants() {
        let err = ClientError::Connection(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(err.to_string().contains("connection error"));

        let err = ClientError::Protocol("bad frame".into());
        assert_eq!(err.to_string(), "protocol error: bad frame");

        let err = ClientError::Aggregate(vec![
            ClientError::aborted(AbortCode::NrClosed, "a"),
            ClientError::aborted(AbortCode::NrClosed, "b"),
        ]);
        assert_eq!(err.to_string(), "2 commands aborted");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let err: ClientError = io_err.into();
        assert!(matches!(err, ClientError::Connection(_)));
    }
}
