//! Public client handle.
//!
//! [`RedisClient`] is a cheap, cloneable handle over the shared connection
//! controller. Commands go in through [`send_command`](RedisClient::send_command)
//! (future-style) or [`send_command_cb`](RedisClient::send_command_cb)
//! (callback-style with a backpressure hint); lifecycle and pub/sub traffic
//! come out of the event stream.

use crate::command::{Command, CommandArg, ResponseSink};
use crate::config::ClientConfig;
use crate::connection::{Shared, Status};
use crate::error::{AbortCode, ClientError, Result};
use crate::events::ClientEvent;
use crate::info::ServerInfo;
use crate::resp::types::RespValue;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, oneshot};

/// Process-lifetime counter backing [`RedisClient::connection_id`].
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A pipelined, auto-reconnecting connection to one Redis server.
///
/// Cloning the handle shares the underlying connection. Must be created
/// from within a tokio runtime; the controller spawns its reader, writer
/// and timer tasks there.
#[derive(Clone)]
pub struct RedisClient {
    shared: Arc<Shared>,
}

/// Resolves with the command's reply. If the client goes away before the
/// reply arrives, the future observes `NR_CLOSED`.
pub struct CommandFuture {
    rx: oneshot::Receiver<Result<RespValue>>,
}

impl Future for CommandFuture {
    type Output = Result<RespValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::aborted(
                AbortCode::NrClosed,
                "Connection forcefully ended and command aborted.",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl RedisClient {
    /// Create a client and start connecting immediately. Commands may be
    /// submitted right away; they are queued until the connection is ready.
    pub fn connect(config: ClientConfig) -> Self {
        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared::new(config, connection_id));
        shared.start();
        Self { shared }
    }

    /// Create a client from a `redis://` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Self::connect(ClientConfig::from_url(url)?))
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Submit a command and get a future for its reply.
    pub fn send_command(&self, name: &str, args: Vec<CommandArg>) -> CommandFuture {
        let (tx, rx) = oneshot::channel();
        let cmd = Command::new(name, args).with_sink(ResponseSink::Channel(tx));
        self.shared.dispatch(cmd);
        CommandFuture { rx }
    }

    /// Submit a command with a completion callback. Returns the
    /// backpressure hint: `false` means the transport (or offline queue) is
    /// saturated and the caller should wait for `drain`.
    pub fn send_command_cb(
        &self,
        name: &str,
        args: Vec<CommandArg>,
        callback: impl FnOnce(Result<RespValue>) + Send + 'static,
    ) -> bool {
        let cmd =
            Command::new(name, args).with_sink(ResponseSink::Callback(Box::new(callback)));
        self.shared.dispatch(cmd)
    }

    /// Convenience: submit and await in one call.
    pub async fn command(&self, name: &str, args: Vec<CommandArg>) -> Result<RespValue> {
        self.send_command(name, args).await
    }

    // ── Batching ───────────────────────────────────────────────────

    /// Begin a batch: subsequent commands accumulate instead of hitting the
    /// socket.
    pub fn cork(&self) {
        self.shared.cork();
    }

    /// Flush the accumulated batch in as few writes as possible.
    pub fn uncork(&self) {
        self.shared.uncork();
    }

    // ── Shutdown ───────────────────────────────────────────────────

    /// Hard stop. With `flush`, every pending command aborts with
    /// `NR_CLOSED`; without it, pending futures resolve the same way but
    /// callbacks are dropped silently.
    pub fn end(&self, flush: bool) {
        self.shared.end(flush);
    }

    /// Graceful stop: sends `QUIT` and tears down once it completes.
    /// Always resolves with `OK`, even when the connection was already gone.
    pub async fn quit(&self) -> Result<RespValue> {
        let (tx, rx) = oneshot::channel();
        self.shared.quit(ResponseSink::Channel(tx));
        match rx.await {
            Ok(Err(err)) if err.code() == Some("NR_CLOSED") => {
                Ok(RespValue::SimpleString("OK".into()))
            }
            Ok(result) => result,
            Err(_) => Ok(RespValue::SimpleString("OK".into())),
        }
    }

    /// Open an independent connection with this client's configuration.
    /// The duplicate starts on the database the original has selected.
    pub fn duplicate(&self) -> RedisClient {
        self.duplicate_with(|_| {})
    }

    /// Like [`duplicate`](Self::duplicate), with config overrides.
    pub fn duplicate_with(&self, adjust: impl FnOnce(&mut ClientConfig)) -> RedisClient {
        let mut config = self.shared.config.clone();
        if let Some(db) = self.shared.with_core(|core, _fx| core.selected_db) {
            config.db = db;
        }
        adjust(&mut config);
        RedisClient::connect(config)
    }

    // ── Introspection ──────────────────────────────────────────────

    /// Subscribe to the lifecycle / pub-sub / monitor event stream.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Commands written but not yet answered.
    pub fn command_queue_len(&self) -> usize {
        self.shared.with_core(|core, _fx| core.queues.in_flight.len())
    }

    /// Commands waiting for the connection to become ready.
    pub fn offline_queue_len(&self) -> usize {
        self.shared.with_core(|core, _fx| core.queues.offline.len())
    }

    /// True when a transport write has been refused since the last drain.
    pub fn should_buffer(&self) -> bool {
        self.shared.with_core(|core, _fx| core.should_buffer)
    }

    /// Diagnostic identifier, unique per client in this process.
    pub fn connection_id(&self) -> u64 {
        self.shared.connection_id
    }

    /// Snapshot from the last successful `INFO`, if any.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.with_core(|core, _fx| core.server_info.clone())
    }

    pub fn is_ready(&self) -> bool {
        self.shared.with_core(|core, _fx| core.status == Status::Ready)
    }
}

impl fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisClient")
            .field("connection_id", &self.shared.connection_id)
            .field("addr", &self.shared.config.addr())
            .finish_non_exhaustive()
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> ClientConfig {
        // Port 1 on loopback refuses immediately; one retry keeps tests fast.
        ClientConfig {
            host: "127.0.0.1".into(),
            port: 1,
            max_attempts: 1,
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn connection_ids_are_unique() {
        let a = RedisClient::connect(unreachable_config());
        let b = RedisClient::connect(unreachable_config());
        assert_ne!(a.connection_id(), b.connection_id());
        a.end(true);
        b.end(true);
    }

    #[tokio::test]
    async fn initial_accessor_state() {
        let client = RedisClient::connect(unreachable_config());
        assert_eq!(client.command_queue_len(), 0);
        assert!(!client.is_ready());
        assert!(client.server_info().is_none());
        client.end(true);
    }

    #[tokio::test]
    async fn commands_queue_offline_before_ready() {
        let client = RedisClient::connect(unreachable_config());
        let _fut = client.send_command("set", vec!["k".into(), "v".into()]);
        assert_eq!(client.offline_queue_len(), 1);
        assert!(client.should_buffer());
        client.end(true);
    }

    #[tokio::test]
    async fn end_aborts_pending_future_with_nr_closed() {
        let client = RedisClient::connect(unreachable_config());
        let fut = client.send_command("get", vec!["k".into()]);
        client.end(true);
        let err = fut.await.unwrap_err();
        assert_eq!(err.code(), Some("NR_CLOSED"));
    }

    #[tokio::test]
    async fn end_without_flush_resolves_future_via_dropped_sink() {
        let client = RedisClient::connect(unreachable_config());
        let fut = client.send_command("get", vec!["k".into()]);
        client.end(false);
        let err = fut.await.unwrap_err();
        assert_eq!(err.code(), Some("NR_CLOSED"));
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let client = RedisClient::connect(unreachable_config());
        client.end(true);
        client.end(true);
        assert!(!client.is_ready());
    }

    #[tokio::test]
    async fn quit_after_end_still_resolves_ok() {
        let client = RedisClient::connect(unreachable_config());
        client.end(true);
        let reply = client.quit().await.unwrap();
        assert_eq!(reply, RespValue::SimpleString("OK".into()));
    }

    #[tokio::test]
    async fn send_after_end_fails_with_nr_closed() {
        let client = RedisClient::connect(unreachable_config());
        client.end(true);
        let err = client
            .send_command("get", vec!["k".into()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("NR_CLOSED"));
        assert!(err.to_string().contains("GET"));
    }

    #[tokio::test]
    async fn offline_queue_disabled_rejects_immediately() {
        let config = ClientConfig {
            enable_offline_queue: false,
            ..unreachable_config()
        };
        let client = RedisClient::connect(config);
        let err = client
            .send_command("get", vec!["k".into()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("NR_CLOSED"));
        client.end(true);
    }

    #[tokio::test]
    async fn debug_format_mentions_addr() {
        let client = RedisClient::connect(unreachable_config());
        let rendered = format!("{client:?}");
        assert!(rendered.contains("RedisClient"));
        assert!(rendered.contains("127.0.0.1:1"));
        client.end(true);
    }
}
