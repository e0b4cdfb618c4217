//! # HSM Connection
//!
//! Purpose: Own one TCP or TLS stream to an HSM node, serialize writes on it
//! and demultiplex the inbound byte stream into responses for many
//! concurrently outstanding requests.
//!
//! ## Design Principles
//! 1. **Exactly One Reader**: The read half moves into a single background task
//!    at construction. Nothing else ever reads the socket.
//! 2. **Serialized Writers**: The write half sits behind an async mutex, so a
//!    frame is always written whole.
//! 3. **Tag Routing**: Responses are matched by correlation tag, never by arrival
//!    order. Out-of-order completion is expected.
//! 4. **No Silent Hangs**: When the stream dies, every request still pending on
//!    it is failed instead of waiting for its own timeout.
//!
//! ## Structure Overview
//!
//! ```text
//!  callers --send()--> [Mutex<WriteHalf>] ---> socket ---> HSM
//!     ^                                                      |
//!     |            ResponseDispatcher <-- read loop task <---+
//!     +---- ResponseHandle resolves --+   (BytesMut, frames split on marker)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hsm_common::{ping_correlation_id, HsmError, HsmResult, Node, ProtocolCodec};

use crate::dispatcher::{ResponseDispatcher, ResponseHandle, DEFAULT_REQUEST_TIMEOUT};

/// Bound on waiting for the read task to exit during `close`.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Initial capacity of the inbound accumulation buffer.
const READ_BUFFER_CAPACITY: usize = 4 * 1024;

/// Largest unterminated frame the read loop will buffer.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Any duplex byte stream an HSM connection can run over.
pub trait HsmStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> HsmStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn HsmStream>;

/// Per-connection timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Idle bound on reads while requests are pending.
    pub read_timeout: Duration,
    /// Deadline for a single ping round-trip.
    pub ping_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            read_timeout: Duration::from_secs(45),
            ping_timeout: Duration::from_millis(100),
        }
    }
}

struct LinkState {
    running: AtomicBool,
    connected: AtomicBool,
    origin: Instant,
    /// Microseconds after `origin` of the last inbound bytes or new request.
    last_activity_us: AtomicU64,
}

impl LinkState {
    fn new() -> Self {
        LinkState {
            running: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            origin: Instant::now(),
            last_activity_us: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.last_activity_us.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// When the socket counts as silent if nothing else happens.
    fn idle_deadline(&self, read_timeout: Duration) -> Instant {
        let last = Duration::from_micros(self.last_activity_us.load(Ordering::Acquire));
        self.origin + last + read_timeout
    }
}

/// A live socket to one HSM node, shared by its read task and callers.
pub struct Connection {
    id: u64,
    node: Node,
    codec: Arc<dyn ProtocolCodec>,
    dispatcher: Arc<ResponseDispatcher>,
    writer: AsyncMutex<Option<WriteHalf<BoxedStream>>>,
    state: Arc<LinkState>,
    reader: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    settings: ConnectionSettings,
}

impl Connection {
    /// Wraps an established stream and starts its read loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream(
        id: u64,
        node: Node,
        stream: BoxedStream,
        codec: Arc<dyn ProtocolCodec>,
        settings: ConnectionSettings,
    ) -> Self {
        let label = format!("{node}#{id}");
        let dispatcher = Arc::new(ResponseDispatcher::new(label.clone()));
        let state = Arc::new(LinkState::new());
        let cancel = CancellationToken::new();

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = ReadLoop {
            label,
            codec: Arc::clone(&codec),
            dispatcher: Arc::clone(&dispatcher),
            state: Arc::clone(&state),
            cancel: cancel.clone(),
            read_timeout: settings.read_timeout,
        };
        let task = tokio::spawn(reader.run(read_half));

        Connection {
            id,
            node,
            codec,
            dispatcher,
            writer: AsyncMutex::new(Some(write_half)),
            state,
            reader: Mutex::new(Some(task)),
            cancel,
            settings,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Requests awaiting a response on this socket.
    pub fn pending_requests(&self) -> usize {
        self.dispatcher.pending_count()
    }

    /// True while the stream is open and its read loop is alive.
    pub fn is_connected(&self) -> bool {
        self.state.running.load(Ordering::Acquire) && self.state.connected.load(Ordering::Acquire)
    }

    /// Writes a tagged command and returns a handle for its response.
    ///
    /// **Input**: raw `command` from the codec, caller-unique `correlation_id`,
    /// optional `timeout` (defaults to [`DEFAULT_REQUEST_TIMEOUT`]).
    /// **Output**: a handle resolving to the parsed payload or an error.
    ///
    /// **Logic**:
    /// 1. Register the pending request (this arms its timeout).
    /// 2. Fail it at once with a connectivity error if the socket is down.
    /// 3. Embed the tag, write the frame plus newline, flush, all within the
    ///    request's own deadline.
    /// 4. On write failure or a stalled write mark the socket dead and fail
    ///    the request with `Io`.
    pub async fn send(
        &self,
        command: &str,
        correlation_id: &str,
        timeout: Option<Duration>,
    ) -> ResponseHandle {
        let timeout = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let deadline = Instant::now() + timeout;
        let handle = match self.dispatcher.register_request(correlation_id, timeout) {
            Ok(handle) => handle,
            Err(err) => return ResponseHandle::failed(correlation_id, err),
        };
        // The idle clock for this request starts now, not at the last read.
        self.state.touch();

        if !self.is_connected() {
            self.dispatcher.complete_send_failure(
                command,
                correlation_id,
                HsmError::Connection(format!("socket to {} is not connected", self.node)),
            );
            return handle;
        }

        let mut frame = self.codec.embed_context_tag(command, correlation_id).into_bytes();
        frame.push(b'\n');

        let write = async {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => write_frame(writer, &frame).await,
                None => Err(HsmError::Connection(format!(
                    "socket to {} is closed",
                    self.node
                ))),
            }
        };
        let written = match tokio::time::timeout_at(deadline, write).await {
            Ok(result) => result,
            Err(_) => Err(HsmError::Io(format!(
                "write to {} stalled for {}ms",
                self.node,
                timeout.as_millis()
            ))),
        };

        match written {
            Ok(()) => debug!(conn = %self, correlation_id, "HSM command written"),
            Err(err) => {
                self.state.connected.store(false, Ordering::Release);
                self.dispatcher.complete_send_failure(command, correlation_id, err);
            }
        }
        handle
    }

    /// Sends the codec's ping under a fresh probe id.
    pub async fn ping(&self) -> HsmResult<String> {
        let command = self.codec.build_ping_command();
        let id = ping_correlation_id();
        self.send(&command, &id, Some(self.settings.ping_timeout)).await.await
    }

    /// Stops the read loop, fails pending requests and closes the socket.
    ///
    /// Idempotent: only the first call does any work.
    pub async fn close(&self) {
        if !self.state.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.state.connected.store(false, Ordering::Release);
        self.cancel.cancel();

        let task = self.reader.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut task).await.is_err() {
                warn!(conn = %self, "read loop did not stop in time, aborting");
                task.abort();
            }
        }

        self.dispatcher.shutdown().await;

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        info!(conn = %self, "HSM connection closed");
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node, self.id)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Without an explicit close the read task still owns the read half.
        self.cancel.cancel();
    }
}

async fn write_frame(writer: &mut WriteHalf<BoxedStream>, frame: &[u8]) -> HsmResult<()> {
    writer
        .write_all(frame)
        .await
        .map_err(|e| HsmError::Io(format!("failed to write to HSM socket: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| HsmError::Io(format!("failed to flush HSM socket: {e}")))?;
    Ok(())
}

struct ReadLoop {
    label: String,
    codec: Arc<dyn ProtocolCodec>,
    dispatcher: Arc<ResponseDispatcher>,
    state: Arc<LinkState>,
    cancel: CancellationToken,
    read_timeout: Duration,
}

impl ReadLoop {
    async fn run(self, mut reader: ReadHalf<BoxedStream>) {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
        let marker = self.codec.response_end_marker().as_bytes().to_vec();

        let reason = loop {
            let idle_deadline = self.state.idle_deadline(self.read_timeout);
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break None,
                _ = tokio::time::sleep_until(idle_deadline) => None,
                read = reader.read_buf(&mut buffer) => Some(read),
            };

            match read {
                None => {
                    // A request sent in the meantime moved the deadline.
                    if Instant::now() < self.state.idle_deadline(self.read_timeout) {
                        continue;
                    }
                    // Idle sockets are fine; silence with work outstanding is not.
                    if self.dispatcher.pending_count() > 0 {
                        break Some(format!(
                            "no data from {} for {}ms with requests pending",
                            self.label,
                            self.read_timeout.as_millis()
                        ));
                    }
                    self.state.touch();
                }
                Some(Ok(0)) => break Some(format!("{} closed the connection", self.label)),
                Some(Ok(_)) => {
                    self.state.touch();
                    while let Some(frame) = next_frame(&mut buffer, &marker) {
                        self.dispatch_frame(&String::from_utf8_lossy(&frame));
                    }
                    if buffer.len() > MAX_FRAME_LEN {
                        break Some(format!(
                            "{} sent {} bytes without a frame end",
                            self.label,
                            buffer.len()
                        ));
                    }
                }
                Some(Err(err)) => break Some(format!("read from {} failed: {err}", self.label)),
            }
        };

        self.state.connected.store(false, Ordering::Release);
        if let Some(reason) = reason {
            if self.state.running.load(Ordering::Acquire) {
                warn!(conn = %self.label, reason = %reason, "HSM read loop stopped");
                self.dispatcher
                    .complete_all_with_error(HsmError::Connection(reason));
            }
        }
        debug!(conn = %self.label, "HSM read loop exited");
    }

    fn dispatch_frame(&self, raw: &str) {
        let frame = raw.trim();
        if frame.is_empty() {
            return;
        }

        let tag = self.codec.extract_context_tag(frame);
        match (self.codec.parse_response(frame), tag) {
            (Ok(payload), Some(tag)) => self.dispatcher.complete_response(&tag, payload),
            (Ok(_), None) => {
                warn!(conn = %self.label, "HSM response without context tag dropped");
            }
            (Err(err), Some(tag)) => {
                let err = match err {
                    HsmError::Command(_) => err,
                    other => HsmError::Command(other.to_string()),
                };
                debug!(conn = %self.label, correlation_id = %tag, error = %err, "HSM command failed");
                self.dispatcher.complete_with_error(&tag, err);
            }
            (Err(err), None) => {
                warn!(conn = %self.label, error = %err, "unparseable HSM frame dropped");
            }
        }
    }
}

/// Splits the next complete frame, up to and including `marker`, off `buffer`.
fn next_frame(buffer: &mut BytesMut, marker: &[u8]) -> Option<BytesMut> {
    if marker.is_empty() || buffer.len() < marker.len() {
        return None;
    }
    let end = buffer
        .windows(marker.len())
        .position(|window| window == marker)?
        + marker.len();
    let frame = buffer.split_to(end);
    // Drop inter-frame line terminators so the buffer can fully drain.
    while buffer.first().is_some_and(|b| b.is_ascii_whitespace()) {
        buffer.advance(1);
    }
    Some(frame)
}
