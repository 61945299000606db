//! Connection lifecycle controller.
//!
//! One [`Shared`] instance owns everything a single logical connection
//! needs: the state vector, the two command queues, the corking writer and
//! the live TCP stream. All mutation funnels through a single
//! `parking_lot::Mutex<Core>` — user calls, reader-task frames, drain-task
//! flushes and timer expirations each take the lock, do their work, and
//! fire deferred sink completions after releasing it.
//!
//! Per-connection tasks (reader, drainer, timers) carry the generation
//! number of the stream they belong to; after a reconnect bumps the
//! generation they observe the mismatch and exit without touching state.

use crate::command::{Command, CommandArg, Internal, OnWrite, ReplyMode, ResponseSink};
use crate::config::{
    default_key_predicate, AddressFamily, ClientConfig, RetryContext, RetryDecision,
    DEFAULT_RETRY_BACKOFF, DEFAULT_RETRY_DELAY_MS,
};
use crate::error::{AbortCode, ClientError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::info::ServerInfo;
use crate::pubsub::{subscribe_family, SubscriberState};
use crate::queue::CommandQueues;
use crate::resp::types::RespValue;
use crate::writer::{coalesce_text, encode_command, CorkBuffer, Outbox, WireFragment};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::Notify;

/// Delay before re-sending AUTH when the server is still loading.
const AUTH_RETRY_DELAY_MS: u64 = 100;

/// Per-command abort aggregates are only emitted as `error` events when
/// the `REWIRE_DEBUG` environment variable is set.
fn debug_mode() -> bool {
    static DEBUG: OnceLock<bool> = OnceLock::new();
    *DEBUG.get_or_init(|| std::env::var_os("REWIRE_DEBUG").is_some())
}

// ── State vector ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Disconnected,
    Connecting,
    /// Stream established, ready check not yet passed.
    Connected,
    Ready,
    Ended,
}

#[derive(Debug)]
pub(crate) struct RetryState {
    /// 1-based attempt counter.
    pub attempts: u64,
    pub delay_ms: u64,
    pub backoff: f64,
    /// Cumulative delay spent reconnecting during this outage.
    pub total_ms: u64,
    /// Non-null iff disconnected and awaiting a scheduled reconnect.
    pub timer_pending: bool,
    pub last_error: Option<String>,
}

impl RetryState {
    fn new() -> Self {
        Self {
            attempts: 1,
            delay_ms: DEFAULT_RETRY_DELAY_MS,
            backoff: DEFAULT_RETRY_BACKOFF,
            total_ms: 0,
            timer_pending: false,
            last_error: None,
        }
    }
}

/// The live stream plus the wakeup handles of its two tasks.
pub(crate) struct Transport {
    pub stream: Arc<TcpStream>,
    /// Wakes the drainer when bytes land in the outbox.
    pub wake: Arc<Notify>,
    /// Wakes the reader so it notices the stream is being torn down; the
    /// socket only closes once both tasks drop their handles.
    pub closed: Arc<Notify>,
}

pub(crate) struct Core {
    pub status: Status,
    pub closing: bool,
    pub emitted_end: bool,
    /// Bumped on every stream change; stale tasks check it and exit.
    pub generation: u64,
    pub transport: Option<Transport>,
    pub outbox: Outbox,
    pub cork: CorkBuffer,
    pub queues: CommandQueues,
    pub subscriber: SubscriberState,
    pub retry: RetryState,
    pub reply_mode: ReplyMode,
    pub should_buffer: bool,
    pub monitoring: bool,
    pub selected_db: Option<u16>,
    pub times_connected: u64,
    pub server_info: Option<ServerInfo>,
    /// Subscribe acks still owed before `ready` may fire after a reconnect.
    pub pending_resubs: usize,
}

impl Core {
    fn new() -> Self {
        Self {
            status: Status::Disconnected,
            closing: false,
            emitted_end: false,
            generation: 0,
            transport: None,
            outbox: Outbox::default(),
            cork: CorkBuffer::new(),
            queues: CommandQueues::new(),
            subscriber: SubscriberState::new(),
            retry: RetryState::new(),
            reply_mode: ReplyMode::On,
            should_buffer: false,
            monitoring: false,
            selected_db: None,
            times_connected: 0,
            server_info: None,
            pending_resubs: 0,
        }
    }

    pub(crate) fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Detach the live transport: both per-connection tasks are woken so
    /// they observe the stale generation and release the socket.
    fn drop_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.wake.notify_one();
            transport.closed.notify_one();
        }
    }

    fn reset_retry(&mut self) {
        self.retry = RetryState::new();
    }
}

// ── Deferred completions ───────────────────────────────────────────

/// Sink completions gathered while the core lock is held and fired after
/// release, so user callbacks can re-enter the client freely.
#[derive(Default)]
pub(crate) struct Effects {
    pub completions: Vec<(ResponseSink, Result<RespValue>)>,
}

impl Effects {
    pub fn complete(&mut self, sink: Option<ResponseSink>, result: Result<RespValue>) {
        if let Some(sink) = sink {
            self.completions.push((sink, result));
        }
    }

    pub(crate) fn run(self) {
        for (sink, result) in self.completions {
            sink.complete(result);
        }
    }
}

/// Which queues a fatal transition drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushScope {
    InFlight,
    Both,
}

enum ConnectFailure {
    Timeout,
    Io(io::Error),
}

enum FlushOutcome {
    Empty,
    Pending,
    Stale,
}

// ── Shared controller ──────────────────────────────────────────────

pub(crate) struct Shared {
    pub config: ClientConfig,
    pub events: EventBus,
    pub core: Mutex<Core>,
    pub connection_id: u64,
}

impl Shared {
    pub(crate) fn new(config: ClientConfig, connection_id: u64) -> Self {
        Self {
            config,
            events: EventBus::new(),
            core: Mutex::new(Core::new()),
            connection_id,
        }
    }

    /// Run `f` inside the critical section, then fire deferred completions.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut Core, &mut Effects) -> R) -> R {
        let mut fx = Effects::default();
        let out = {
            let mut core = self.core.lock();
            f(&mut core, &mut fx)
        };
        fx.run();
        out
    }

    // ── Connecting ─────────────────────────────────────────────────

    /// Kick off the first connection attempt.
    pub(crate) fn start(self: &Arc<Self>) {
        self.with_core(|core, _fx| {
            if core.status != Status::Disconnected {
                return;
            }
            core.status = Status::Connecting;
            let generation = core.next_generation();
            self.spawn_connect(generation);
        });
    }

    fn spawn_connect(self: &Arc<Self>, generation: u64) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            match shared.open_stream().await {
                Ok(stream) => shared.on_stream_connected(generation, stream),
                Err(ConnectFailure::Timeout) => shared.on_connect_timeout(generation),
                Err(ConnectFailure::Io(e)) => {
                    shared.connection_gone(Some(generation), "connect", Some(e.into()))
                }
            }
        });
    }

    async fn open_stream(&self) -> std::result::Result<TcpStream, ConnectFailure> {
        if let Some(path) = &self.config.path {
            return Err(ConnectFailure::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("UNIX socket transport is not available in this build: {path}"),
            )));
        }
        if self.config.tls {
            return Err(ConnectFailure::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                "TLS transport is not available in this build; use redis://",
            )));
        }
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        match tokio::time::timeout(timeout, self.open_tcp()).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ConnectFailure::Io(e)),
            Err(_) => Err(ConnectFailure::Timeout),
        }
    }

    async fn open_tcp(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host((self.config.host.as_str(), self.config.port)).await? {
            let family_ok = match self.config.family {
                AddressFamily::Auto => true,
                AddressFamily::V4 => addr.is_ipv4(),
                AddressFamily::V6 => addr.is_ipv6(),
            };
            if !family_ok {
                continue;
            }
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            if self.config.socket_keepalive {
                socket.set_keepalive(true)?;
            }
            match socket.connect(addr).await {
                Ok(stream) => {
                    if self.config.socket_nodelay {
                        stream.set_nodelay(true).ok();
                    }
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
        }))
    }

    fn on_stream_connected(self: &Arc<Self>, generation: u64, stream: TcpStream) {
        self.with_core(|core, fx| {
            if core.generation != generation || core.status != Status::Connecting {
                return;
            }
            let stream = Arc::new(stream);
            let wake = Arc::new(Notify::new());
            let closed = Arc::new(Notify::new());
            core.transport = Some(Transport {
                stream: Arc::clone(&stream),
                wake: Arc::clone(&wake),
                closed: Arc::clone(&closed),
            });
            core.status = Status::Connected;
            core.times_connected += 1;
            core.emitted_end = false;
            core.reset_retry();
            tracing::debug!(id = self.connection_id, "stream connected");
            self.events.emit(ClientEvent::Connect);

            self.spawn_reader(generation, Arc::clone(&stream), closed);
            self.spawn_drainer(generation, stream, wake);

            // AUTH precedes the ready check when credentials are configured.
            if self.config.password.is_some() {
                self.send_auth(core, fx);
            } else {
                self.continue_handshake(core, fx);
            }
        });
    }

    fn on_connect_timeout(self: &Arc<Self>, generation: u64) {
        self.with_core(|core, fx| {
            if core.generation != generation {
                return;
            }
            // Exhaust the budget so the broken-state path fires at once.
            core.retry.total_ms = self.config.connect_timeout_ms;
            let err = io::Error::new(io::ErrorKind::TimedOut, "connect attempt timed out");
            self.connection_gone_locked(core, fx, "timeout", Some(err.into()));
        });
    }

    // ── Handshake ──────────────────────────────────────────────────

    pub(crate) fn send_auth(self: &Arc<Self>, core: &mut Core, fx: &mut Effects) {
        let mut args: Vec<CommandArg> = Vec::new();
        if let Some(user) = &self.config.username {
            args.push(user.as_str().into());
        }
        if let Some(pass) = &self.config.password {
            args.push(pass.as_str().into());
        }
        let cmd = Command::new("auth", args).with_internal(Internal::Auth);
        self.write_command(core, fx, cmd);
    }

    pub(crate) fn continue_handshake(self: &Arc<Self>, core: &mut Core, fx: &mut Effects) {
        if self.config.no_ready_check {
            self.begin_ready(core, fx);
        } else {
            self.send_info_probe(core, fx);
        }
    }

    pub(crate) fn send_info_probe(self: &Arc<Self>, core: &mut Core, fx: &mut Effects) {
        let cmd = Command::new("info", vec![]).with_internal(Internal::ReadyInfo);
        self.write_command(core, fx, cmd);
    }

    pub(crate) fn schedule_auth_retry(self: &Arc<Self>, core: &Core) {
        let shared = Arc::clone(self);
        let generation = core.generation;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(AUTH_RETRY_DELAY_MS)).await;
            shared.with_core(|core, fx| {
                if core.generation == generation
                    && matches!(core.status, Status::Connected | Status::Ready)
                {
                    shared.send_auth(core, fx);
                }
            });
        });
    }

    pub(crate) fn schedule_ready_recheck(self: &Arc<Self>, core: &Core, delay_ms: u64) {
        let shared = Arc::clone(self);
        let generation = core.generation;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            shared.with_core(|core, fx| {
                if core.generation == generation && core.status == Status::Connected {
                    shared.send_info_probe(core, fx);
                }
            });
        });
    }

    /// The server is usable: select the database, restore monitor mode and
    /// subscriptions, then replay the offline queue. `ready` is emitted only
    /// after resubscription acknowledgements come back.
    pub(crate) fn begin_ready(self: &Arc<Self>, core: &mut Core, fx: &mut Effects) {
        if core.status != Status::Connected {
            return;
        }
        core.status = Status::Ready;
        tracing::debug!(id = self.connection_id, "connection ready");

        let db = core
            .selected_db
            .or((self.config.db != 0).then_some(self.config.db));
        if let Some(db) = db {
            let cmd = Command::new("select", vec![CommandArg::Text(db.to_string())])
                .with_internal(Internal::SelectDb(db));
            self.write_command(core, fx, cmd);
        }
        if core.monitoring {
            let cmd = Command::new("monitor", vec![]).with_internal(Internal::Monitor);
            self.write_command(core, fx, cmd);
        }

        if !self.config.disable_resubscribing && !core.subscriber.is_empty() {
            let entries = core.subscriber.entries();
            core.pending_resubs = entries.len();
            core.cork.cork();
            for (kind, channel) in entries {
                let cmd = Command::new(kind.command(), vec![CommandArg::Text(channel)])
                    .with_internal(Internal::Resubscribe);
                self.write_command(core, fx, cmd);
            }
            self.uncork_locked(core);
            return;
        }
        self.finish_ready(core, fx);
    }

    pub(crate) fn finish_ready(self: &Arc<Self>, core: &mut Core, fx: &mut Effects) {
        core.pending_resubs = 0;
        // Offline replay preserves submission order; the whole batch goes
        // out corked as one write.
        if !core.queues.offline.is_empty() {
            core.cork.cork();
            while let Some(cmd) = core.queues.offline.pop_front() {
                self.write_command(core, fx, cmd);
            }
            self.uncork_locked(core);
        }
        if core.outbox.is_empty() {
            core.should_buffer = false;
        }
        self.events.emit(ClientEvent::Drain);
        self.events.emit(ClientEvent::Ready);
    }

    // ── Command dispatch ───────────────────────────────────────────

    /// Entry point for user commands. Returns the backpressure hint:
    /// `false` means stop writing until `drain`.
    pub(crate) fn dispatch(self: &Arc<Self>, cmd: Command) -> bool {
        self.with_core(|core, fx| self.dispatch_locked(core, fx, cmd))
    }

    pub(crate) fn dispatch_locked(
        self: &Arc<Self>,
        core: &mut Core,
        fx: &mut Effects,
        cmd: Command,
    ) -> bool {
        if core.closing || core.status != Status::Ready || core.transport.is_none() {
            return self.handle_offline(core, fx, cmd);
        }
        self.write_command(core, fx, cmd)
    }

    /// The command cannot go on the wire right now: park it in the offline
    /// queue, or abort it when queueing is unavailable.
    fn handle_offline(&self, core: &mut Core, fx: &mut Effects, mut cmd: Command) -> bool {
        if core.closing || core.status == Status::Ended || !self.config.enable_offline_queue {
            let detail = if core.closing || core.status == Status::Ended {
                "The connection is already closed."
            } else if core.transport.is_none() || core.should_buffer {
                "Stream not writeable."
            } else {
                "The connection is not yet established and the offline queue is deactivated."
            };
            let message = format!(
                "{} command can't be processed. {}",
                cmd.name.to_ascii_uppercase(),
                detail
            );
            let err = ClientError::aborted(AbortCode::NrClosed, message)
                .with_command(&cmd.name, cmd.arg_strings());
            fx.complete(cmd.sink.take(), Err(err));
            return false;
        }
        tracing::trace!(command = %cmd.name, "queued offline");
        core.queues.offline.push_back(cmd);
        core.should_buffer = true;
        false
    }

    /// Serialize a command, commit its bytes (or cork them), fire the
    /// pre-write hook, then decide whether it expects a reply. The hook runs
    /// between commit and the enqueue decision, which is what makes
    /// `CLIENT REPLY OFF|SKIP` suppress its own acknowledgement.
    pub(crate) fn write_command(
        self: &Arc<Self>,
        core: &mut Core,
        fx: &mut Effects,
        mut cmd: Command,
    ) -> bool {
        attach_on_write(&mut cmd);

        let wire_name = match self.config.rename_commands.get(&cmd.name) {
            Some(renamed) => renamed.clone(),
            None => cmd.name.to_ascii_uppercase(),
        };
        if let Some(prefix) = &self.config.prefix {
            match &self.config.key_predicate {
                Some(pred) => {
                    let pred = Arc::clone(pred);
                    cmd.apply_prefix(prefix, move |name, idx| (*pred)(name, idx));
                }
                None => cmd.apply_prefix(prefix, default_key_predicate),
            }
        }

        let fragments = encode_command(&cmd, &wire_name);
        if core.cork.is_corked() {
            core.cork.push(fragments, cmd.buffer_args);
        } else if cmd.buffer_args {
            let chunks = fragments.into_iter().map(WireFragment::into_bytes).collect();
            self.write_chunks(core, chunks);
        } else {
            self.write_chunks(core, coalesce_text(fragments));
        }

        if let Some(hook) = cmd.on_write.take() {
            match hook {
                // Reply-mode changes are ignored while the pub/sub overlay
                // is engaged.
                OnWrite::SetReplyMode(mode) => {
                    if !core.subscriber.is_active() {
                        core.reply_mode = mode;
                    }
                }
                OnWrite::EnterSubscriber => {
                    core.subscriber.enter_pending(core.queues.in_flight.len());
                }
                OnWrite::SetMonitoring => core.monitoring = true,
            }
        }

        match core.reply_mode {
            ReplyMode::On => core.queues.in_flight.push_back(cmd),
            ReplyMode::Off => fx.complete(cmd.sink.take(), Ok(RespValue::Null)),
            ReplyMode::Skip => {
                fx.complete(cmd.sink.take(), Ok(RespValue::Null));
                core.reply_mode = ReplyMode::SkipOneMore;
            }
            ReplyMode::SkipOneMore => {
                fx.complete(cmd.sink.take(), Ok(RespValue::Null));
                core.reply_mode = ReplyMode::On;
            }
        }

        !core.should_buffer
    }

    // ── Corking ────────────────────────────────────────────────────

    pub(crate) fn cork(self: &Arc<Self>) {
        self.with_core(|core, _fx| core.cork.cork());
    }

    pub(crate) fn uncork(self: &Arc<Self>) {
        self.with_core(|core, _fx| self.uncork_locked(core));
    }

    pub(crate) fn uncork_locked(self: &Arc<Self>, core: &mut Core) {
        let (fragments, fire_strings) = core.cork.uncork();
        if fragments.is_empty() {
            return;
        }
        let chunks = if fire_strings {
            coalesce_text(fragments)
        } else {
            fragments.into_iter().map(WireFragment::into_bytes).collect()
        };
        self.write_chunks(core, chunks);
    }

    // ── Transport writes ───────────────────────────────────────────

    fn write_chunks(self: &Arc<Self>, core: &mut Core, chunks: Vec<Bytes>) {
        for chunk in chunks {
            self.write_chunk(core, chunk);
        }
    }

    fn write_chunk(self: &Arc<Self>, core: &mut Core, chunk: Bytes) {
        let Some(transport) = &core.transport else {
            core.should_buffer = true;
            return;
        };
        if !core.outbox.is_empty() {
            core.outbox.push_back(chunk);
            core.should_buffer = true;
            transport.wake.notify_one();
            return;
        }
        let stream = Arc::clone(&transport.stream);
        let wake = Arc::clone(&transport.wake);
        let mut offset = 0;
        while offset < chunk.len() {
            match stream.try_write(&chunk[offset..]) {
                Ok(0) => {
                    core.outbox.push_back(chunk.slice(offset..));
                    core.should_buffer = true;
                    wake.notify_one();
                    return;
                }
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    core.outbox.push_back(chunk.slice(offset..));
                    core.should_buffer = true;
                    wake.notify_one();
                    return;
                }
                Err(e) => {
                    self.defer_connection_gone(core, "write", e.into());
                    return;
                }
            }
        }
    }

    /// Schedule `connection_gone` outside the current critical section.
    /// Write failures surface inline under the lock, but teardown must see a
    /// consistent queue state, so it runs on its own task.
    fn defer_connection_gone(self: &Arc<Self>, core: &Core, why: &'static str, err: ClientError) {
        let shared = Arc::clone(self);
        let generation = core.generation;
        tokio::spawn(async move {
            shared.connection_gone(Some(generation), why, Some(err));
        });
    }

    // ── Reader / drainer tasks ─────────────────────────────────────

    fn spawn_reader(
        self: &Arc<Self>,
        generation: u64,
        stream: Arc<TcpStream>,
        closed: Arc<Notify>,
    ) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.reader_task(generation, stream, closed).await;
        });
    }

    async fn reader_task(self: Arc<Self>, generation: u64, stream: Arc<TcpStream>, closed: Arc<Notify>) {
        use crate::resp::parser;
        use bytes::BytesMut;

        // A reply larger than this kills the connection, not the process.
        const MAX_REPLY_BYTES: usize = 512 * 1024 * 1024;

        let mut buf = BytesMut::with_capacity(16 * 1024);
        loop {
            // Drain every complete frame before reading more.
            while !buf.is_empty() {
                let snapshot = buf.split().freeze();
                match parser::parse(&snapshot) {
                    Ok((value, consumed)) => {
                        if consumed < snapshot.len() {
                            buf.extend_from_slice(&snapshot[consumed..]);
                        }
                        if !self.handle_frame(generation, value) {
                            return;
                        }
                    }
                    Err(ClientError::Incomplete) => {
                        buf.extend_from_slice(&snapshot);
                        break;
                    }
                    Err(err) => {
                        self.on_parser_fatal(generation, err);
                        return;
                    }
                }
            }
            if buf.len() > MAX_REPLY_BYTES {
                self.on_parser_fatal(
                    generation,
                    ClientError::Protocol("reply exceeds maximum buffer size".into()),
                );
                return;
            }

            tokio::select! {
                readable = stream.readable() => {
                    if readable.is_err() {
                        self.connection_gone(Some(generation), "read", None);
                        return;
                    }
                }
                _ = closed.notified() => return,
            }
            buf.reserve(4096);
            match stream.try_read_buf(&mut buf) {
                Ok(0) => {
                    self.connection_gone(Some(generation), "end", None);
                    return;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    self.connection_gone(Some(generation), "read", Some(e.into()));
                    return;
                }
            }
        }
    }

    fn spawn_drainer(
        self: &Arc<Self>,
        generation: u64,
        stream: Arc<TcpStream>,
        wake: Arc<Notify>,
    ) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                wake.notified().await;
                loop {
                    if stream.writable().await.is_err() {
                        shared.connection_gone(Some(generation), "write", None);
                        return;
                    }
                    match shared.flush_outbox(generation) {
                        FlushOutcome::Empty => break,
                        FlushOutcome::Pending => continue,
                        FlushOutcome::Stale => return,
                    }
                }
            }
        });
    }

    fn flush_outbox(self: &Arc<Self>, generation: u64) -> FlushOutcome {
        self.with_core(|core, _fx| {
            if core.generation != generation {
                return FlushOutcome::Stale;
            }
            let stream = match &core.transport {
                Some(t) => Arc::clone(&t.stream),
                None => return FlushOutcome::Stale,
            };
            loop {
                let written = {
                    let Some(chunk) = core.outbox.front() else { break };
                    match stream.try_write(chunk) {
                        Ok(0) => return FlushOutcome::Pending,
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return FlushOutcome::Pending;
                        }
                        Err(e) => {
                            self.defer_connection_gone(core, "write", e.into());
                            return FlushOutcome::Stale;
                        }
                    }
                };
                core.outbox.advance(written);
            }
            if core.should_buffer {
                core.should_buffer = false;
                self.events.emit(ClientEvent::Drain);
            }
            FlushOutcome::Empty
        })
    }

    // ── Disconnects & retries ──────────────────────────────────────

    pub(crate) fn connection_gone(
        self: &Arc<Self>,
        generation: Option<u64>,
        why: &'static str,
        error: Option<ClientError>,
    ) {
        self.with_core(|core, fx| {
            if let Some(generation) = generation {
                if core.generation != generation {
                    return;
                }
            }
            self.connection_gone_locked(core, fx, why, error);
        });
    }

    pub(crate) fn connection_gone_locked(
        self: &Arc<Self>,
        core: &mut Core,
        fx: &mut Effects,
        why: &'static str,
        error: Option<ClientError>,
    ) {
        // Reconnection attempts never overlap.
        if core.retry.timer_pending || core.status == Status::Ended {
            return;
        }
        tracing::debug!(id = self.connection_id, why, "connection gone");
        if let Some(err) = &error {
            core.retry.last_error = Some(err.message());
        }

        // Tear down per-connection state. The generation bump detaches the
        // dead stream's reader and drainer.
        core.next_generation();
        core.drop_transport();
        core.cork.reset();
        core.outbox.clear();
        core.subscriber.reset_mode();
        core.reply_mode = ReplyMode::On;
        core.pending_resubs = 0;
        core.status = Status::Disconnected;

        if !core.emitted_end {
            core.emitted_end = true;
            self.events.emit(ClientEvent::End);
        }

        if core.closing {
            core.status = Status::Ended;
            self.flush_and_error(
                core,
                fx,
                AbortCode::NrClosed,
                "Connection forcefully ended and command aborted.",
                FlushScope::Both,
            );
            return;
        }

        if let Some(strategy) = &self.config.retry_strategy {
            let decision = (**strategy)(RetryContext {
                attempt: core.retry.attempts,
                error: core.retry.last_error.clone(),
                total_retry_time_ms: core.retry.total_ms,
                times_connected: core.times_connected,
            });
            match decision {
                RetryDecision::Delay(ms) => core.retry.delay_ms = ms,
                RetryDecision::Stop | RetryDecision::StopWithError(_) => {
                    core.status = Status::Ended;
                    self.flush_and_error(
                        core,
                        fx,
                        AbortCode::NrClosed,
                        "Connection forcefully ended and command aborted.",
                        FlushScope::Both,
                    );
                    if let RetryDecision::StopWithError(msg) = decision {
                        self.events.emit(ClientEvent::Error(Arc::new(ClientError::aborted(
                            AbortCode::NrClosed,
                            msg,
                        ))));
                    }
                    return;
                }
            }
        } else {
            let attempts_exhausted =
                self.config.max_attempts > 0 && core.retry.attempts > self.config.max_attempts;
            let time_exhausted = core.retry.total_ms >= self.config.connect_timeout_ms;
            if attempts_exhausted || time_exhausted {
                let detail = if time_exhausted {
                    "connection timeout exceeded."
                } else {
                    "maximum connection attempts exceeded."
                };
                let message = format!("Redis connection in broken state: {detail}");
                core.status = Status::Ended;
                self.flush_and_error(
                    core,
                    fx,
                    AbortCode::ConnectionBroken,
                    &message,
                    FlushScope::Both,
                );
                self.events.emit(ClientEvent::Error(Arc::new(ClientError::aborted(
                    AbortCode::ConnectionBroken,
                    message,
                ))));
                return;
            }
        }

        // Commands that were on the wire either replay or abort.
        if self.config.retry_unfulfilled_commands {
            core.queues.requeue_in_flight();
        } else {
            self.flush_and_error(
                core,
                fx,
                AbortCode::UncertainState,
                "Redis connection lost and command aborted.",
                FlushScope::InFlight,
            );
        }

        // Cap the delay by the per-attempt ceiling, then by whatever budget
        // remains.
        if let Some(max) = self.config.retry_max_delay_ms {
            core.retry.delay_ms = core.retry.delay_ms.min(max);
        }
        core.retry.delay_ms = core
            .retry
            .delay_ms
            .min(self.config.connect_timeout_ms.saturating_sub(core.retry.total_ms));

        core.retry.timer_pending = true;
        let shared = Arc::clone(self);
        let delay = core.retry.delay_ms;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            shared.retry_connection();
        });
    }

    fn retry_connection(self: &Arc<Self>) {
        self.with_core(|core, fx| {
            if !core.retry.timer_pending {
                return;
            }
            core.retry.timer_pending = false;
            if core.closing {
                core.status = Status::Ended;
                self.flush_and_error(
                    core,
                    fx,
                    AbortCode::NrClosed,
                    "Connection forcefully ended and command aborted.",
                    FlushScope::Both,
                );
                return;
            }
            if core.status != Status::Disconnected {
                return;
            }
            self.events.emit(ClientEvent::Reconnecting {
                delay_ms: core.retry.delay_ms,
                attempt: core.retry.attempts,
                error: core.retry.last_error.clone(),
                total_retry_time_ms: core.retry.total_ms,
                times_connected: core.times_connected,
            });
            core.retry.total_ms += core.retry.delay_ms;
            core.retry.attempts += 1;
            core.retry.delay_ms = (core.retry.delay_ms as f64 * core.retry.backoff).round() as u64;
            core.status = Status::Connecting;
            let generation = core.next_generation();
            self.spawn_connect(generation);
        });
    }

    // ── Fatal parser errors ────────────────────────────────────────

    pub(crate) fn on_parser_fatal(self: &Arc<Self>, generation: u64, err: ClientError) {
        self.with_core(|core, fx| {
            if core.generation != generation {
                return;
            }
            tracing::error!(id = self.connection_id, %err, "fatal parser error");
            self.flush_and_error(
                core,
                fx,
                AbortCode::NrFatal,
                "Fatal error encountered. Command aborted.",
                FlushScope::InFlight,
            );
            self.events.emit(ClientEvent::Error(Arc::new(err)));
            self.connection_gone_locked(core, fx, "parser", None);
        });
    }

    // ── Error flusher ──────────────────────────────────────────────

    /// Drain the selected queues, aborting every queued command with `code`.
    /// In-flight commands get the "might have been processed" suffix; the
    /// offline queue does not. Sinkless errors aggregate into one `error`
    /// event when debug mode is on.
    pub(crate) fn flush_and_error(
        &self,
        core: &mut Core,
        fx: &mut Effects,
        code: AbortCode,
        message: &str,
        scope: FlushScope,
    ) {
        let mut aggregated: Vec<ClientError> = Vec::new();

        let in_flight = core.queues.drain_in_flight();
        let suffixed = format!("{message} It might have been processed.");
        for cmd in in_flight {
            Self::flush_one(cmd, code, &suffixed, fx, &mut aggregated);
        }
        if scope == FlushScope::Both {
            let offline = core.queues.drain_offline();
            for cmd in offline {
                Self::flush_one(cmd, code, message, fx, &mut aggregated);
            }
        }

        if debug_mode() && !aggregated.is_empty() {
            let err = if aggregated.len() == 1 {
                aggregated.pop().unwrap()
            } else {
                ClientError::Aggregate(aggregated)
            };
            self.events.emit(ClientEvent::Error(Arc::new(err)));
        }
    }

    fn flush_one(
        mut cmd: Command,
        code: AbortCode,
        message: &str,
        fx: &mut Effects,
        aggregated: &mut Vec<ClientError>,
    ) {
        // QUIT resolves cleanly even through a flush.
        if cmd.internal == Some(Internal::Quit) {
            fx.complete(cmd.sink.take(), Ok(RespValue::SimpleString("OK".into())));
            return;
        }
        let err = ClientError::aborted(code, message.to_string())
            .with_command(&cmd.name, cmd.arg_strings());
        match cmd.sink.take() {
            Some(sink) => fx.completions.push((sink, Err(err))),
            None => aggregated.push(err),
        }
    }

    // ── Shutdown ───────────────────────────────────────────────────

    /// Hard stop. With `flush`, every queued command aborts with
    /// `NR_CLOSED`; without it, pending sinks are simply dropped (their
    /// futures observe the closed channel).
    pub(crate) fn end(self: &Arc<Self>, flush: bool) {
        self.with_core(|core, fx| {
            if core.status == Status::Ended {
                return;
            }
            core.closing = true;
            if flush {
                self.flush_and_error(
                    core,
                    fx,
                    AbortCode::NrClosed,
                    "Connection forcefully ended and command aborted.",
                    FlushScope::Both,
                );
            } else {
                let dropped =
                    core.queues.in_flight.len() + core.queues.offline.len();
                if dropped > 0 {
                    self.events.emit(ClientEvent::Warning(format!(
                        "end(false) dropped {dropped} pending commands without completion"
                    )));
                }
                core.queues.drain_in_flight();
                core.queues.drain_offline();
            }
            core.next_generation();
            core.drop_transport();
            core.outbox.clear();
            core.cork.reset();
            core.subscriber.reset_mode();
            core.retry.timer_pending = false;
            core.status = Status::Ended;
            if !core.emitted_end {
                core.emitted_end = true;
                self.events.emit(ClientEvent::End);
            }
        });
    }

    /// Graceful stop: enqueue `QUIT`, then refuse further commands. The
    /// attached sink always resolves with `OK`, even when the connection is
    /// already gone.
    pub(crate) fn quit(self: &Arc<Self>, sink: ResponseSink) {
        self.with_core(|core, fx| {
            if core.status == Status::Ended {
                fx.complete(Some(sink), Ok(RespValue::SimpleString("OK".into())));
                return;
            }
            let cmd = Command::new("quit", vec![])
                .with_sink(sink)
                .with_internal(Internal::Quit);
            // Enqueue before flipping `closing`, so QUIT itself is not
            // rejected by the offline handler.
            self.dispatch_locked(core, fx, cmd);
            core.closing = true;
        });
    }

    /// Tear down after QUIT's acknowledgement (or its abort) came back.
    pub(crate) fn finalize_quit(self: &Arc<Self>, core: &mut Core, fx: &mut Effects) {
        core.closing = true;
        core.next_generation();
        core.drop_transport();
        core.outbox.clear();
        core.cork.reset();
        core.subscriber.reset_mode();
        core.retry.timer_pending = false;
        core.status = Status::Ended;
        if !core.emitted_end {
            core.emitted_end = true;
            self.events.emit(ClientEvent::End);
        }
        self.flush_and_error(
            core,
            fx,
            AbortCode::NrClosed,
            "Connection forcefully ended and command aborted.",
            FlushScope::Both,
        );
    }
}

// ── Write hooks ────────────────────────────────────────────────────

/// Attach the pre-write hook for commands that mutate controller state
/// between commit and enqueue.
fn attach_on_write(cmd: &mut Command) {
    if cmd.on_write.is_some() {
        return;
    }
    if subscribe_family(&cmd.name).is_some() {
        cmd.on_write = Some(OnWrite::EnterSubscriber);
    } else if cmd.name == "monitor" {
        cmd.on_write = Some(OnWrite::SetMonitoring);
    } else if cmd.name == "client" {
        let subcommand = cmd.args.first().and_then(CommandArg::as_text);
        let mode = cmd.args.get(1).and_then(CommandArg::as_text);
        if let (Some(subcommand), Some(mode)) = (subcommand, mode) {
            if subcommand.eq_ignore_ascii_case("reply") {
                let mode = match mode.to_ascii_uppercase().as_str() {
                    "ON" => Some(ReplyMode::On),
                    "OFF" => Some(ReplyMode::Off),
                    "SKIP" => Some(ReplyMode::Skip),
                    _ => None,
                };
                if let Some(mode) = mode {
                    cmd.on_write = Some(OnWrite::SetReplyMode(mode));
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
