//! Reply dispatching.
//!
//! Every frame the parser yields lands in [`Shared::handle_frame`]. Monitor
//! feed lines and pub/sub traffic are intercepted first; everything else
//! pops the head of the in-flight queue and completes it. The controller's
//! own handshake commands (AUTH, INFO, SELECT, resubscribes, QUIT) carry an
//! [`Internal`] marker and are consumed here instead of reaching a user sink.

use crate::command::{Command, CommandArg, Internal};
use crate::connection::{Core, Effects, Shared, Status};
use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::info::ServerInfo;
use crate::monitor::parse_monitor_line;
use crate::pubsub::{subscribe_family, SubKind};
use crate::resp::types::RespValue;
use bytes::Bytes;
use std::sync::Arc;

/// Upper bound on the loading re-check interval during the ready probe.
const LOADING_RECHECK_CAP_MS: u64 = 1000;
/// Re-check interval while a replica reports its master link down.
const MASTER_LINK_RECHECK_MS: u64 = 50;

// ── Pub/sub frame classification ───────────────────────────────────

enum PubSubFrame {
    Message {
        channel: String,
        payload: Bytes,
    },
    PMessage {
        pattern: String,
        channel: String,
        payload: Bytes,
    },
    Ack {
        kind: SubKind,
        adds: bool,
        channel: Option<String>,
        count: i64,
    },
}

fn frame_text(value: &RespValue) -> Option<String> {
    value
        .as_bytes()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
}

fn frame_payload(value: &RespValue) -> Bytes {
    match value {
        RespValue::BulkString(b) => b.clone(),
        other => Bytes::copy_from_slice(other.as_bytes().unwrap_or_default()),
    }
}

/// Decide whether a reply is server-pushed pub/sub traffic. Non-arrays and
/// short arrays are not (that covers `PING`/`QUIT` replies inside
/// subscriber mode).
fn pubsub_frame(reply: &RespValue) -> Option<PubSubFrame> {
    let RespValue::Array(items) = reply else {
        return None;
    };
    if items.len() <= 2 {
        return None;
    }
    let kind = items[0].as_str()?;
    match kind {
        "message" if items.len() == 3 => Some(PubSubFrame::Message {
            channel: frame_text(&items[1])?,
            payload: frame_payload(&items[2]),
        }),
        "pmessage" if items.len() == 4 => Some(PubSubFrame::PMessage {
            pattern: frame_text(&items[1])?,
            channel: frame_text(&items[2])?,
            payload: frame_payload(&items[3]),
        }),
        other => {
            let (kind, adds) = subscribe_family(other)?;
            let channel = match &items[1] {
                RespValue::Null => None,
                value => Some(frame_text(value)?),
            };
            // The ack count is numeric on the wire regardless of any
            // number-formatting option.
            let count = items[2].as_int()?;
            Some(PubSubFrame::Ack {
                kind,
                adds,
                channel,
                count,
            })
        }
    }
}

impl Shared {
    // ── Frame entry point ──────────────────────────────────────────

    /// Route one parsed frame. Returns false when the frame belonged to a
    /// stream that is no longer current, telling the reader task to exit.
    pub(crate) fn handle_frame(self: &Arc<Self>, generation: u64, value: RespValue) -> bool {
        let mut fx = Effects::default();
        let alive = {
            let mut core = self.core.lock();
            if core.generation != generation {
                false
            } else {
                match value {
                    RespValue::Error(message) => self.on_error_reply(&mut core, &mut fx, message),
                    other => self.on_reply(&mut core, &mut fx, other),
                }
                true
            }
        };
        fx.run();
        alive
    }

    fn on_reply(self: &Arc<Self>, core: &mut Core, fx: &mut Effects, reply: RespValue) {
        // Monitor feed lines win over everything else; they never shift the
        // queue.
        if core.monitoring {
            if let RespValue::SimpleString(line) = &reply {
                if let Some(parsed) = parse_monitor_line(line) {
                    self.events.emit(ClientEvent::Monitor {
                        timestamp: parsed.timestamp,
                        args: parsed.args,
                        raw: parsed.raw,
                    });
                    return;
                }
            }
        }

        if core.subscriber.is_active() {
            // Replies owed to commands from before pub/sub entry drain the
            // countdown first.
            if core.subscriber.countdown() {
                return self.complete_head(core, fx, reply);
            }
            return match pubsub_frame(&reply) {
                Some(frame) => self.on_pubsub_frame(core, fx, frame),
                None => self.complete_head(core, fx, reply),
            };
        }

        self.complete_head(core, fx, reply)
    }

    fn on_error_reply(self: &Arc<Self>, core: &mut Core, fx: &mut Effects, message: String) {
        // Error replies still drain the pub/sub entry countdown.
        if core.subscriber.mode > 1 {
            core.subscriber.countdown();
        }
        let Some(mut cmd) = core.queues.in_flight.pop_front() else {
            let err = ClientError::reply(message);
            tracing::error!(id = self.connection_id, %err, "error reply with empty queue");
            self.events.emit(ClientEvent::Error(Arc::new(err)));
            return;
        };
        if let Some(kind) = cmd.internal {
            let err = ClientError::reply(message);
            return self.on_internal_reply(core, fx, kind, cmd, Err(err));
        }
        let err = ClientError::reply(message).with_command(&cmd.name, cmd.arg_strings());
        match cmd.sink.take() {
            Some(sink) => fx.completions.push((sink, Err(err))),
            None => self.events.emit(ClientEvent::Error(Arc::new(err))),
        }
    }

    // ── Normal replies ─────────────────────────────────────────────

    fn complete_head(self: &Arc<Self>, core: &mut Core, fx: &mut Effects, reply: RespValue) {
        let Some(mut cmd) = core.queues.in_flight.pop_front() else {
            let err = ClientError::Protocol(format!(
                "unexpected {} reply with no command in flight",
                reply.type_name()
            ));
            tracing::error!(id = self.connection_id, %err, "reply desync");
            self.events.emit(ClientEvent::Error(Arc::new(err)));
            return;
        };
        if let Some(kind) = cmd.internal {
            return self.on_internal_reply(core, fx, kind, cmd, Ok(reply));
        }
        // Track SELECT so duplicate() and reconnects land on the same db.
        if cmd.name == "select" {
            if let Some(db) = cmd
                .args
                .first()
                .and_then(CommandArg::as_text)
                .and_then(|s| s.parse().ok())
            {
                core.selected_db = Some(db);
            }
        }
        let value = self.postprocess(&cmd, reply);
        fx.complete(cmd.sink.take(), Ok(value));
    }

    /// Per-client reply shaping, applied after the head command is known.
    fn postprocess(&self, cmd: &Command, reply: RespValue) -> RespValue {
        let mut value = reply;
        if cmd.name == "hgetall" {
            value = fold_hgetall(value);
        }
        if self.config.detect_buffers && !cmd.buffer_args {
            value = bulk_to_text(value);
        }
        if self.config.string_numbers {
            value = numbers_to_text(value);
        }
        value
    }

    // ── Pub/sub traffic ────────────────────────────────────────────

    fn on_pubsub_frame(self: &Arc<Self>, core: &mut Core, fx: &mut Effects, frame: PubSubFrame) {
        match frame {
            PubSubFrame::Message { channel, payload } => {
                self.events.emit(ClientEvent::Message { channel, payload });
            }
            PubSubFrame::PMessage {
                pattern,
                channel,
                payload,
            } => {
                self.events.emit(ClientEvent::PMessage {
                    pattern,
                    channel,
                    payload,
                });
            }
            PubSubFrame::Ack {
                kind,
                adds,
                channel,
                count,
            } => self.on_subscribe_ack(core, fx, kind, adds, channel, count),
        }
    }

    fn on_subscribe_ack(
        self: &Arc<Self>,
        core: &mut Core,
        fx: &mut Effects,
        kind: SubKind,
        adds: bool,
        channel: Option<String>,
        count: i64,
    ) {
        let count_usize = count.max(0) as usize;
        let name = channel.clone().unwrap_or_default();
        self.events.emit(match (kind, adds) {
            (SubKind::Channel, true) => ClientEvent::Subscribe {
                channel: name,
                count: count_usize,
            },
            (SubKind::Channel, false) => ClientEvent::Unsubscribe {
                channel: name,
                count: count_usize,
            },
            (SubKind::Pattern, true) => ClientEvent::PSubscribe {
                pattern: name,
                count: count_usize,
            },
            (SubKind::Pattern, false) => ClientEvent::PUnsubscribe {
                pattern: name,
                count: count_usize,
            },
        });

        if let Some(channel) = &channel {
            core.subscriber.record_ack(kind, adds, channel);
        }

        // The head command may cover several channels; complete it on its
        // last acknowledgement.
        let complete = match core.queues.in_flight.front_mut() {
            Some(head) if subscribe_family(&head.name).is_some() => {
                match head.sub_commands_left {
                    Some(1) => true,
                    Some(left) => {
                        head.sub_commands_left = Some(left - 1);
                        false
                    }
                    None => {
                        if head.args.len() == 1
                            || (head.args.is_empty() && (count == 0 || channel.is_none()))
                        {
                            true
                        } else {
                            head.sub_commands_left = Some(if head.args.is_empty() {
                                count_usize
                            } else {
                                head.args.len() - 1
                            });
                            false
                        }
                    }
                }
            }
            _ => false,
        };
        if complete {
            let mut cmd = core
                .queues
                .in_flight
                .pop_front()
                .expect("in-flight head vanished");
            if cmd.internal == Some(Internal::Resubscribe) {
                self.on_resubscribe_ack(core, fx);
            } else {
                let result = match &channel {
                    Some(name) => RespValue::Text(name.clone()),
                    None => RespValue::Null,
                };
                fx.complete(cmd.sink.take(), Ok(result));
            }
        }

        // Unsubscribing down to zero re-derives the overlay mode from
        // whatever subscribe commands remain in flight.
        if !adds && count == 0 {
            core.subscriber.rederive_mode(&core.queues);
        }
    }

    fn on_resubscribe_ack(self: &Arc<Self>, core: &mut Core, fx: &mut Effects) {
        if core.pending_resubs > 0 {
            core.pending_resubs -= 1;
        }
        if core.pending_resubs == 0 {
            self.finish_ready(core, fx);
        }
    }

    // ── Internal command replies ───────────────────────────────────

    fn on_internal_reply(
        self: &Arc<Self>,
        core: &mut Core,
        fx: &mut Effects,
        kind: Internal,
        mut cmd: Command,
        result: Result<RespValue>,
    ) {
        match kind {
            Internal::Auth => match result {
                Ok(_) => self.continue_handshake(core, fx),
                Err(err) => {
                    let message = err.message();
                    if message.starts_with("LOADING") {
                        // Dataset still loading; authenticate again shortly.
                        self.schedule_auth_retry(core);
                    } else if message.contains("no password is set") {
                        self.events.emit(ClientEvent::Warning(
                            "Redis server does not require a password, but a password was supplied."
                                .into(),
                        ));
                        self.continue_handshake(core, fx);
                    } else {
                        self.events.emit(ClientEvent::Error(Arc::new(err)));
                    }
                }
            },
            Internal::ReadyInfo => match result {
                Ok(reply) => self.on_info_reply(core, fx, reply),
                Err(err) => {
                    if err.message().contains("unknown command") {
                        // INFO can be renamed away; trust the connection.
                        self.begin_ready(core, fx);
                    } else {
                        self.events.emit(ClientEvent::Error(Arc::new(err)));
                    }
                }
            },
            Internal::SelectDb(db) => match result {
                Ok(_) => core.selected_db = Some(db),
                Err(err) => self.events.emit(ClientEvent::Error(Arc::new(err))),
            },
            Internal::Monitor => {
                // The monitoring flag was set by the write hook.
                if let Err(err) = result {
                    self.events.emit(ClientEvent::Error(Arc::new(err)));
                }
            }
            Internal::Resubscribe => {
                // Normally consumed by the ack path; an error reply must
                // still count down or `ready` would never fire.
                if let Err(err) = result {
                    self.events.emit(ClientEvent::Error(Arc::new(err)));
                }
                self.on_resubscribe_ack(core, fx);
            }
            Internal::Quit => {
                fx.complete(cmd.sink.take(), Ok(RespValue::SimpleString("OK".into())));
                self.finalize_quit(core, fx);
            }
        }
    }

    fn on_info_reply(self: &Arc<Self>, core: &mut Core, fx: &mut Effects, reply: RespValue) {
        let Some(raw) = reply.as_str() else {
            // Unexpected shape; treat the server as usable.
            return self.begin_ready(core, fx);
        };
        let info = ServerInfo::parse(raw);
        let loading = info.loading();
        let eta_ms = info.loading_eta_ms();
        let link_down = info.master_link_down();
        core.server_info = Some(info);

        if loading {
            let delay = eta_ms
                .unwrap_or(LOADING_RECHECK_CAP_MS)
                .min(LOADING_RECHECK_CAP_MS);
            tracing::debug!(delay_ms = delay, "server loading, ready check deferred");
            return self.schedule_ready_recheck(core, delay);
        }
        if link_down {
            tracing::debug!("master link down, ready check deferred");
            return self.schedule_ready_recheck(core, MASTER_LINK_RECHECK_MS);
        }
        if core.status == Status::Connected {
            self.begin_ready(core, fx);
        }
    }
}

// ── Reply shaping helpers ──────────────────────────────────────────

/// Fold a flat even-length `HGETALL` reply array into key/value pairs.
fn fold_hgetall(value: RespValue) -> RespValue {
    match value {
        RespValue::Array(items) if items.len() % 2 == 0 => {
            let mut pairs = Vec::with_capacity(items.len() / 2);
            let mut iter = items.into_iter();
            while let (Some(key), Some(val)) = (iter.next(), iter.next()) {
                let key = match key.as_str() {
                    Some(text) => text.to_string(),
                    None => match key.as_bytes() {
                        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                        None => continue,
                    },
                };
                pairs.push((key, val));
            }
            RespValue::Map(pairs)
        }
        other => other,
    }
}

/// Decode every bulk payload to UTF-8 text, recursively.
fn bulk_to_text(value: RespValue) -> RespValue {
    match value {
        RespValue::BulkString(bytes) => {
            RespValue::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        RespValue::Array(items) => {
            RespValue::Array(items.into_iter().map(bulk_to_text).collect())
        }
        RespValue::Map(pairs) => RespValue::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k, bulk_to_text(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Render integer replies as decimal text, recursively.
fn numbers_to_text(value: RespValue) -> RespValue {
    match value {
        RespValue::Integer(n) => RespValue::Text(n.to_string()),
        RespValue::Array(items) => {
            RespValue::Array(items.into_iter().map(numbers_to_text).collect())
        }
        RespValue::Map(pairs) => RespValue::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k, numbers_to_text(v)))
                .collect(),
        ),
        other => other,
    }
}

// ── Tests ──────────────────────────────────────────────────────────
