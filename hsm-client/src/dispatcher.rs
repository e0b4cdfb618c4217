//! # Response Dispatcher
//!
//! Purpose: Match inbound response frames to the requests that produced them,
//! using the correlation id echoed in each frame, and enforce a per-request
//! deadline.
//!
//! ## Design Principles
//! 1. **Single Winner**: Every completion path first removes the entry from the
//!    pending map under the lock. Only the caller that removed it may resolve
//!    it, so normal completion, error and timeout can never both fire.
//! 2. **Generation Guard**: Each registration carries a sequence number. A
//!    stale timer whose id was completed and then reused cannot remove the
//!    newer request.
//! 3. **Owned Timers**: Timeout tasks live on a [`TaskTracker`] owned by the
//!    dispatcher and are cancelled by its shutdown token, never on an ambient
//!    global scheduler.
//!
//! ## Structure Overview
//!
//! ```text
//! register("BD_1")  --> pending { "BD_1" => (seq 7, Sender) }
//!                    \-> timer task (seq 7) sleeps until deadline
//!
//! read loop frame   --> complete_response("BD_1") removes + sends Ok
//! timer fires       --> entry for seq 7 is gone, no-op
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use hsm_common::{HsmError, HsmResult};

/// Deadline applied when a caller does not supply one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound for in-flight timer tasks to wind down on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Slot = oneshot::Sender<HsmResult<String>>;

struct PendingRequest {
    seq: u64,
    deadline: Instant,
    slot: Slot,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// Correlation-keyed completion registry for a single connection.
pub struct ResponseDispatcher {
    label: String,
    pending: PendingMap,
    next_seq: AtomicU64,
    closed: AtomicBool,
    timers: TaskTracker,
    cancel: CancellationToken,
}

impl ResponseDispatcher {
    /// Creates a dispatcher. `label` identifies the owning connection in logs.
    pub fn new(label: impl Into<String>) -> Self {
        ResponseDispatcher {
            label: label.into(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            timers: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Registers a pending request and arms its timeout.
    ///
    /// **Input**: `correlation_id` unique among this dispatcher's pending
    /// requests, `timeout` for this request only.
    /// **Output**: a [`ResponseHandle`] that resolves exactly once, or
    /// `SocketShutdown`/`Rejected` when the request cannot be registered.
    ///
    /// **Logic**:
    /// 1. Refuse when shut down or when the id is already pending.
    /// 2. Insert the slot with a fresh sequence number.
    /// 3. Spawn a timer that removes the entry only if the sequence still matches.
    pub fn register_request(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> HsmResult<ResponseHandle> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HsmError::SocketShutdown(format!(
                "dispatcher for {} is shut down",
                self.label
            )));
        }

        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(correlation_id) {
                return Err(HsmError::Rejected(format!(
                    "correlation id {correlation_id} is already pending"
                )));
            }
            pending.insert(
                correlation_id.to_string(),
                PendingRequest {
                    seq,
                    deadline,
                    slot: tx,
                },
            );
        }

        let pending = Arc::clone(&self.pending);
        let cancel = self.cancel.clone();
        let id = correlation_id.to_string();
        self.timers.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let expired = {
                        let mut map = pending.lock();
                        match map.get(&id) {
                            Some(entry) if entry.seq == seq => map.remove(&id),
                            _ => None,
                        }
                    };
                    if let Some(entry) = expired {
                        warn!(correlation_id = %id, timeout_ms = timeout.as_millis() as u64, "HSM request timed out");
                        let _ = entry.slot.send(Err(HsmError::Timeout(format!(
                            "no response for {id} within {}ms",
                            timeout.as_millis()
                        ))));
                    }
                }
            }
        });

        Ok(ResponseHandle::new(correlation_id, rx))
    }

    /// Resolves the pending request with a payload. No-op if already resolved.
    pub fn complete_response(&self, correlation_id: &str, payload: String) {
        match self.take(correlation_id) {
            Some(entry) => {
                debug!(
                    correlation_id,
                    remaining_ms = entry.deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "HSM response matched"
                );
                let _ = entry.slot.send(Ok(payload));
            }
            None => debug!(correlation_id, "late or unknown HSM response dropped"),
        }
    }

    /// Resolves the pending request with an error. No-op if already resolved.
    pub fn complete_with_error(&self, correlation_id: &str, error: HsmError) {
        if let Some(entry) = self.take(correlation_id) {
            let _ = entry.slot.send(Err(error));
        }
    }

    /// Resolves a request whose command never reached the HSM.
    ///
    /// Connectivity and I/O failures keep their tag so the pool invalidates the
    /// socket; anything else is reported as unexpected. Only the command code is
    /// echoed, never key material.
    pub fn complete_send_failure(&self, command: &str, correlation_id: &str, error: HsmError) {
        let classified = if error.is_connectivity() {
            error
        } else {
            let code = command.split('#').next().unwrap_or_default();
            HsmError::Unexpected(format!("failed to send command {code}: {error}"))
        };
        warn!(correlation_id, error = %classified, "HSM command send failed");
        self.complete_with_error(correlation_id, classified);
    }

    /// Resolves every pending request with `error` and empties the registry.
    pub fn complete_all_with_error(&self, error: HsmError) {
        let drained: Vec<(String, PendingRequest)> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            warn!(dispatcher = %self.label, count = drained.len(), error = %error, "failing all pending HSM requests");
        }
        for (_, entry) in drained {
            let _ = entry.slot.send(Err(error.clone()));
        }
    }

    /// Number of requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fails everything still pending, then stops the timer facility.
    ///
    /// Waits up to [`SHUTDOWN_GRACE`] for timer tasks to observe cancellation.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.complete_all_with_error(HsmError::SocketShutdown(format!(
            "connection {} shut down",
            self.label
        )));
        self.cancel.cancel();
        self.timers.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.timers.wait()).await.is_err() {
            warn!(dispatcher = %self.label, "timer tasks did not stop in time");
        }
    }

    fn take(&self, correlation_id: &str) -> Option<PendingRequest> {
        self.pending.lock().remove(correlation_id)
    }
}

impl Drop for ResponseDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Deferred result of a single request.
///
/// Resolves to the parsed payload, or to the error that completed the request.
pub struct ResponseHandle {
    correlation_id: String,
    rx: oneshot::Receiver<HsmResult<String>>,
}

impl ResponseHandle {
    fn new(correlation_id: &str, rx: oneshot::Receiver<HsmResult<String>>) -> Self {
        ResponseHandle {
            correlation_id: correlation_id.to_string(),
            rx,
        }
    }

    /// A handle that is already resolved with `error`.
    pub fn failed(correlation_id: &str, error: HsmError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        ResponseHandle::new(correlation_id, rx)
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for ResponseHandle {
    type Output = HsmResult<String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.rx).poll(cx);
        match polled {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without a value: the dispatcher itself went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(HsmError::SocketShutdown(format!(
                "dispatcher dropped request {}",
                self.correlation_id
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}
