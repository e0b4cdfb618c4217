//! # Simulated HSM Server
//!
//! Accept newline-terminated command frames, answer each with a tagged
//! response frame according to the active [`Behavior`].

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hsm_common::{Node, ProtocolCodec, UtimacoCodec, CAVV_COMMAND, ERROR_RESPONSE, HMAC_COMMAND, PING_COMMAND};

/// How the simulator answers frames.
///
/// Pings are answered normally by every behaviour except `Silent` and
/// `Garbage`, so a node can look healthy while failing real traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answer every frame.
    Normal,
    /// Drop the socket on the first non-ping command.
    CloseOnCommand,
    /// Read frames and never answer.
    Silent,
    /// Answer with an untagged, unparseable frame.
    Garbage,
    /// Answer commands with an `ER` rejection.
    Reject,
    /// Answer every frame after a fixed delay, out of band.
    Delay(Duration),
    /// Answer every frame after a per-frame delay below the bound, so replies
    /// on one socket come back out of order.
    Jitter(Duration),
}

struct SimState {
    behavior: Mutex<Behavior>,
    connections: AtomicUsize,
    commands: AtomicUsize,
    pings: AtomicUsize,
}

/// Handle to a running simulator.
pub struct SimServer {
    addr: SocketAddr,
    state: Arc<SimState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SimServer {
    /// Starts a simulator on an ephemeral loopback port.
    pub async fn start(behavior: Behavior) -> io::Result<SimServer> {
        SimServer::bind("127.0.0.1:0", behavior).await
    }

    /// Starts a simulator on `addr`.
    pub async fn bind(addr: &str, behavior: Behavior) -> io::Result<SimServer> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(SimState {
            behavior: Mutex::new(behavior),
            connections: AtomicUsize::new(0),
            commands: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&state), shutdown_rx));
        info!(%addr, ?behavior, "HSM simulator listening");

        Ok(SimServer {
            addr,
            state,
            shutdown,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The simulator as a configured HSM node.
    pub fn node(&self) -> Node {
        Node::new(self.addr.ip().to_string(), self.addr.port())
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.state.behavior.lock() = behavior;
    }

    /// Sockets accepted so far.
    pub fn connections_accepted(&self) -> usize {
        self.state.connections.load(Ordering::Relaxed)
    }

    /// Non-ping frames received so far.
    pub fn commands_received(&self) -> usize {
        self.state.commands.load(Ordering::Relaxed)
    }

    pub fn pings_received(&self) -> usize {
        self.state.pings.load(Ordering::Relaxed)
    }

    /// Stops accepting and drops every open connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
        info!(addr = %self.addr, "HSM simulator stopped");
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<SimState>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    state.connections.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, "simulator accepted connection");
                    let state = Arc::clone(&state);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, state, shutdown).await {
                            debug!(%peer, error = %err, "simulator connection ended");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "simulator accept failed"),
            },
        }
    }
}

enum Reply {
    Now(Vec<u8>),
    Later(Duration, Vec<u8>),
    Nothing,
    Close,
}

/// Handles a single client connection.
async fn handle_connection(
    stream: TcpStream,
    state: Arc<SimState>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(AsyncMutex::new(writer));
    let mut buffer = BytesMut::with_capacity(8 * 1024);

    loop {
        let bytes = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            read = reader.read_buf(&mut buffer) => read?,
        };
        if bytes == 0 {
            break;
        }

        while let Some(line) = next_line(&mut buffer) {
            let behavior = *state.behavior.lock();
            match dispatch_frame(&line, behavior, &state) {
                Reply::Now(response) => write_reply(&writer, &response).await?,
                Reply::Later(delay, response) => {
                    let writer = Arc::clone(&writer);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = write_reply(&writer, &response).await;
                    });
                }
                Reply::Nothing => {}
                Reply::Close => return Ok(()),
            }
        }
    }

    Ok(())
}

async fn write_reply(writer: &AsyncMutex<OwnedWriteHalf>, response: &[u8]) -> io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(response).await?;
    writer.flush().await
}

fn next_line(buffer: &mut BytesMut) -> Option<String> {
    let end = buffer.iter().position(|&b| b == b'\n')?;
    let line = buffer.split_to(end);
    buffer.advance(1);
    Some(String::from_utf8_lossy(&line).trim().to_string())
}

fn dispatch_frame(frame: &str, behavior: Behavior, state: &SimState) -> Reply {
    if frame.is_empty() {
        return Reply::Nothing;
    }

    let codec = UtimacoCodec::new();
    let tag = codec.extract_context_tag(frame);
    let code = command_code(frame);
    let is_ping = code == Some(PING_COMMAND);
    if is_ping {
        state.pings.fetch_add(1, Ordering::Relaxed);
    } else {
        state.commands.fetch_add(1, Ordering::Relaxed);
    }

    match behavior {
        Behavior::Silent => Reply::Nothing,
        Behavior::Garbage => Reply::Now(b"<garbage>\n".to_vec()),
        Behavior::CloseOnCommand if !is_ping => Reply::Close,
        Behavior::Reject if !is_ping => Reply::Now(response_frame(ERROR_RESPONSE, "15", tag.as_deref())),
        Behavior::Delay(delay) => Reply::Later(delay, answer(frame, code, tag.as_deref())),
        Behavior::Jitter(bound) => Reply::Later(jitter(frame, bound), answer(frame, code, tag.as_deref())),
        _ => Reply::Now(answer(frame, code, tag.as_deref())),
    }
}

fn answer(frame: &str, code: Option<&str>, tag: Option<&str>) -> Vec<u8> {
    match code {
        Some(PING_COMMAND) => response_frame(PING_COMMAND, "OK", tag),
        Some(CAVV_COMMAND) => response_frame("6D", &digest(request_body(frame)), tag),
        Some(HMAC_COMMAND) => response_frame("49B", &digest(request_body(frame)), tag),
        _ => response_frame(ERROR_RESPONSE, "UNKNOWN_COMMAND", tag),
    }
}

fn command_code(frame: &str) -> Option<&str> {
    let rest = frame.strip_prefix('<')?;
    rest.split('#').next().filter(|code| !code.is_empty())
}

/// Request text with the context tag removed, so retries hash identically.
fn request_body(frame: &str) -> &str {
    match frame.rfind("#^") {
        Some(idx) => &frame[..idx],
        None => frame,
    }
}

fn response_frame(code: &str, payload: &str, tag: Option<&str>) -> Vec<u8> {
    let mut buf = String::with_capacity(code.len() + payload.len() + 32);
    buf.push('<');
    buf.push_str(code);
    buf.push('#');
    buf.push_str(payload);
    buf.push('#');
    if let Some(tag) = tag {
        buf.push('^');
        buf.push_str(tag);
        buf.push('#');
    }
    buf.push_str(">\n");
    buf.into_bytes()
}

fn fnv1a(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// FNV-1a, rendered as 16 upper-case hex digits.
fn digest(input: &str) -> String {
    format!("{:016X}", fnv1a(input))
}

/// Delay in `[0, bound)` derived from the whole frame, tag included.
fn jitter(frame: &str, bound: Duration) -> Duration {
    let bound_us = u64::try_from(bound.as_micros()).unwrap_or(u64::MAX).max(1);
    Duration::from_micros(fnv1a(frame) % bound_us)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;

    async fn roundtrip(server: &SimServer, request: &str) -> String {
        let stream = TcpStream::connect(server.addr()).await.unwrap();
        let mut stream = BufReader::new(stream);
        stream.get_mut().write_all(request.as_bytes()).await.unwrap();
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn answers_ping_with_tag() {
        let server = SimServer::start(Behavior::Normal).await.unwrap();
        let reply = roundtrip(&server, "<00#^PING_1_abc#>\n").await;
        assert_eq!(reply, "<00#OK#^PING_1_abc#>\n");
        assert_eq!(server.pings_received(), 1);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn hmac_reply_is_deterministic_and_parseable() {
        let server = SimServer::start(Behavior::Normal).await.unwrap();
        let first = roundtrip(&server, "<39B#KB##2#DATA#^T1#>\n").await;
        let second = roundtrip(&server, "<39B#KB##2#DATA#^T2#>\n").await;

        let codec = UtimacoCodec::new();
        let a = codec.parse_response(&first).unwrap();
        let b = codec.parse_response(&second).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_eq!(codec.extract_context_tag(&second).as_deref(), Some("T2"));
        assert_eq!(server.commands_received(), 2);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn reject_answers_commands_with_error_code() {
        let server = SimServer::start(Behavior::Reject).await.unwrap();
        let reply = roundtrip(&server, "<5D#3#KB##DATA#^C1#>\n").await;
        assert_eq!(reply, "<ER#15#^C1#>\n");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn close_on_command_still_answers_pings() {
        let server = SimServer::start(Behavior::CloseOnCommand).await.unwrap();
        let stream = TcpStream::connect(server.addr()).await.unwrap();
        let mut stream = BufReader::new(stream);

        stream.get_mut().write_all(b"<00#^P1#>\n").await.unwrap();
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        assert_eq!(line, "<00#OK#^P1#>\n");

        stream.get_mut().write_all(b"<39B#KB##2#D#^C1#>\n").await.unwrap();
        line.clear();
        assert_eq!(stream.read_line(&mut line).await.unwrap(), 0);
        server.shutdown().await;
    }

    #[test]
    fn jitter_stays_below_bound() {
        let bound = Duration::from_millis(20);
        for tag in ["A", "B", "C", "D"] {
            assert!(jitter(&format!("<39B#KB##2#D#^{tag}#>"), bound) < bound);
        }
    }

    #[test]
    fn extracts_command_code() {
        assert_eq!(command_code("<39B#KB##2#D#^T#>"), Some("39B"));
        assert_eq!(command_code("<00#^T#>"), Some("00"));
        assert_eq!(command_code("garbage"), None);
    }
}
