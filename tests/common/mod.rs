//! Shared helpers for integration tests.
//!
//! Tests drive the client against in-process mock servers bound to
//! `127.0.0.1:0`, scripting exact byte-level conversations.

#![allow(dead_code)]

use rewire::{ClientConfig, ClientEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

/// Bind a fresh listener on an ephemeral port.
pub async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Client config pointed at a mock server. The ready check is disabled by
/// default so test conversations stay byte-exact; tests that exercise the
/// INFO probe flip it back on.
pub fn test_config(port: u16) -> ClientConfig {
    ClientConfig {
        host: "127.0.0.1".into(),
        port,
        no_ready_check: true,
        ..ClientConfig::default()
    }
}

/// An INFO payload a healthy server would return.
pub fn ready_info_reply() -> Vec<u8> {
    let body = "# Server\r\nredis_version:7.2.4\r\n\r\n# Persistence\r\nloading:0\r\n";
    let mut reply = format!("${}\r\n", body.len()).into_bytes();
    reply.extend_from_slice(body.as_bytes());
    reply.extend_from_slice(b"\r\n");
    reply
}

/// An INFO payload from a server still loading its dataset.
pub fn loading_info_reply() -> Vec<u8> {
    let body = "loading:1\r\nloading_eta_seconds:0\r\n";
    let mut reply = format!("${}\r\n", body.len()).into_bytes();
    reply.extend_from_slice(body.as_bytes());
    reply.extend_from_slice(b"\r\n");
    reply
}

// ── Server-side command reader ─────────────────────────────────────

/// Reads RESP multi-bulk command frames off a socket, keeping the raw byte
/// transcript for exact-wire assertions.
pub struct CommandReader {
    socket: TcpStream,
    buf: Vec<u8>,
    cursor: usize,
}

impl CommandReader {
    pub fn new(socket: TcpStream) -> Self {
        Self {
            socket,
            buf: Vec::new(),
            cursor: 0,
        }
    }

    /// Every byte received so far.
    pub fn transcript(&self) -> &[u8] {
        &self.buf
    }

    /// Read the next complete command frame. Returns `None` on EOF.
    pub async fn next_command(&mut self) -> Option<Vec<String>> {
        loop {
            if let Some((args, consumed)) = parse_command(&self.buf[self.cursor..]) {
                self.cursor += consumed;
                return Some(args);
            }
            let mut chunk = [0u8; 4096];
            match timeout(Duration::from_secs(5), self.socket.read(&mut chunk)).await {
                Ok(Ok(0)) => return None,
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) => return None,
                Err(_) => panic!("timed out waiting for a command frame"),
            }
        }
    }

    /// Read `count` command frames.
    pub async fn next_commands(&mut self, count: usize) -> Vec<Vec<String>> {
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(self.next_command().await.expect("connection closed early"));
        }
        frames
    }

    pub async fn reply(&mut self, bytes: &[u8]) {
        self.socket.write_all(bytes).await.unwrap();
    }

    pub fn into_socket(self) -> TcpStream {
        self.socket
    }
}

/// Parse one `*N\r\n$len\r\narg\r\n…` frame. Returns `(args, consumed)` or
/// `None` when incomplete.
fn parse_command(buf: &[u8]) -> Option<(Vec<String>, usize)> {
    fn read_line(buf: &[u8], at: usize) -> Option<(&[u8], usize)> {
        let rel = buf.get(at..)?.windows(2).position(|w| w == b"\r\n")?;
        Some((&buf[at..at + rel], at + rel + 2))
    }

    if buf.first() != Some(&b'*') {
        return None;
    }
    let (line, mut at) = read_line(buf, 1)?;
    let argc: usize = std::str::from_utf8(line).ok()?.parse().ok()?;
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        if buf.get(at) != Some(&b'$') {
            return None;
        }
        let (line, next) = read_line(buf, at + 1)?;
        let len: usize = std::str::from_utf8(line).ok()?.parse().ok()?;
        if buf.len() < next + len + 2 {
            return None;
        }
        args.push(String::from_utf8_lossy(&buf[next..next + len]).into_owned());
        at = next + len + 2;
    }
    Some((args, at))
}

// ── Event helpers ──────────────────────────────────────────────────

pub async fn next_event(rx: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream lagged")
}

/// Skip events until one satisfies the predicate.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<ClientEvent>,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

pub async fn wait_ready(rx: &mut broadcast::Receiver<ClientEvent>) {
    wait_for(rx, |e| matches!(e, ClientEvent::Ready)).await;
}
