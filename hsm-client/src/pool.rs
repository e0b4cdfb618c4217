//! # Connection Pool
//!
//! Purpose: Keep a bounded set of long-lived sockets to one HSM node, hand
//! them out one caller at a time, and track whether the node is fit to
//! receive traffic.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Connections are reused, never shared. A borrowed
//!    connection belongs to exactly one caller until it is returned or invalidated.
//! 2. **Minimal Locking**: The state mutex is held only while moving idle
//!    connections. Socket I/O always happens outside it.
//! 3. **Bounded Waits**: Borrowing waits on a semaphore sized to `max_total`, with
//!    a timeout, instead of failing fast like a synchronous pool would.
//! 4. **Health as Routing Signal**: The health flag is independent of how many
//!    sockets are idle; the balancer consults only the flag.
//!
//! ## Structure Overview
//!
//! ```text
//! ConnectionPool ── Arc<PoolInner>
//!                    ├─ factory      (node, codec, TLS)
//!                    ├─ permits      Semaphore(max_total), one per borrow
//!                    ├─ state        Mutex { idle: VecDeque<Connection>, total, closed }
//!                    └─ healthy      AtomicBool (default true)
//!
//! borrow ──> permit ──> pop idle (test on borrow) ──> or factory.create()
//! drop(PooledConnection) ──> push idle if valid, else close in background
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use hsm_common::{HsmError, HsmResult, Node};

use crate::connection::Connection;
use crate::factory::ConnectionFactory;

/// Pool configuration for one node.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Connections created eagerly and probed by warm-up and health checks.
    pub min_idle: usize,
    /// How long `borrow` waits for a free slot.
    pub borrow_timeout: Duration,
    /// Deadline for application commands.
    pub request_timeout: Duration,
    /// Bound on a single ping in warm-up and health-check paths.
    pub probe_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_total: 1,
            min_idle: 1,
            borrow_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_millis(400),
            probe_wait: Duration::from_secs(1),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub total: usize,
    pub max_total: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "active={} idle={} total={} max={}",
            self.active, self.idle, self.total, self.max_total
        )
    }
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    factory: ConnectionFactory,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    healthy: AtomicBool,
}

impl PoolInner {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
    }

    /// Puts a connection back unless the pool closed or the socket died.
    fn return_connection(&self, conn: Connection) -> Option<Connection> {
        let mut state = self.state.lock();
        if state.closed || !conn.is_connected() {
            state.total = state.total.saturating_sub(1);
            return Some(conn);
        }
        state.idle.push_back(conn);
        None
    }
}

/// Pool handle for one HSM node.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool. Call [`ConnectionPool::prepare`] to pre-warm it.
    pub fn new(factory: ConnectionFactory, mut config: PoolConfig) -> Self {
        config.max_total = config.max_total.max(1);
        config.min_idle = config.min_idle.min(config.max_total);
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_total),
            total: 0,
            closed: false,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max_total)),
                config,
                factory,
                state: Mutex::new(state),
                healthy: AtomicBool::new(true),
            }),
        }
    }

    /// Creates a pool and eagerly opens `min_idle` connections.
    pub async fn connect(factory: ConnectionFactory, config: PoolConfig) -> Self {
        let pool = ConnectionPool::new(factory, config);
        pool.prepare().await;
        pool
    }

    /// Opens connections until `min_idle` are idle. Failures are logged only.
    pub async fn prepare(&self) {
        let wanted = {
            let state = self.inner.state.lock();
            self.inner.config.min_idle.saturating_sub(state.idle.len())
        };
        for _ in 0..wanted {
            if !self.try_reserve() {
                break;
            }
            match self.inner.factory.create().await {
                Ok(conn) => {
                    if let Some(conn) = self.inner.return_connection(conn) {
                        conn.close().await;
                    }
                }
                Err(err) => {
                    self.inner.release_slot();
                    error!(node = %self.node(), error = %err, "error occurred while preparing HSM pool");
                    break;
                }
            }
        }
        info!(node = %self.node(), stats = %self.stats(), "HSM pool prepared");
    }

    pub fn node(&self) -> &Node {
        self.inner.factory.node()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }

    pub fn mark_healthy(&self) {
        self.inner.healthy.store(true, Ordering::Release);
    }

    pub fn mark_unhealthy(&self) {
        self.inner.healthy.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            active: state.total.saturating_sub(state.idle.len()),
            idle: state.idle.len(),
            total: state.total,
            max_total: self.inner.config.max_total,
        }
    }

    /// Borrows a live connection, waiting up to `borrow_timeout` for a slot.
    ///
    /// **Logic**:
    /// 1. Acquire a semaphore permit (bounded wait).
    /// 2. Pop idle connections, discarding any that fail validation.
    /// 3. If none is idle, reserve a slot and create a new connection.
    pub async fn borrow(&self) -> HsmResult<PooledConnection> {
        let permits = Arc::clone(&self.inner.permits);
        let permit = match tokio::time::timeout(self.inner.config.borrow_timeout, permits.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(HsmError::Connection(format!("pool for {} is closed", self.node())))
            }
            Err(_) => {
                return Err(HsmError::Connection(format!(
                    "timed out after {}ms waiting for a connection to {}",
                    self.inner.config.borrow_timeout.as_millis(),
                    self.node()
                )))
            }
        };

        while let Some(conn) = self.pop_idle()? {
            if self.inner.factory.validate(&conn) {
                return Ok(PooledConnection::new(Arc::clone(&self.inner), conn, permit));
            }
            debug!(conn = %conn, "discarding stale HSM connection on borrow");
            self.inner.release_slot();
            self.inner.factory.destroy(conn).await;
        }

        if !self.try_reserve() {
            return Err(HsmError::Connection(format!("pool for {} is exhausted", self.node())));
        }
        match self.inner.factory.create().await {
            Ok(conn) => Ok(PooledConnection::new(Arc::clone(&self.inner), conn, permit)),
            Err(err) => {
                self.inner.release_slot();
                Err(err)
            }
        }
    }

    fn pop_idle(&self) -> HsmResult<Option<Connection>> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(HsmError::Connection(format!("pool for {} is closed", self.node())));
        }
        Ok(state.idle.pop_front())
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.closed || state.total >= self.inner.config.max_total {
            return false;
        }
        state.total += 1;
        true
    }

    /// Runs one command on a borrowed connection.
    ///
    /// **Input**: raw `command`, caller-unique `correlation_id`.
    /// **Output**: the HSM payload or the error that ended the request.
    ///
    /// **Logic**:
    /// 1. Fail fast with `UnhealthyNode` if the pool is marked unhealthy.
    /// 2. Borrow; on failure demote the pool if nothing is active and report
    ///    a connectivity error.
    /// 3. Send and await the response.
    /// 4. Invalidate the connection on connectivity errors, return it otherwise.
    pub async fn execute_command(&self, command: &str, correlation_id: &str) -> HsmResult<String> {
        if !self.is_healthy() {
            return Err(HsmError::UnhealthyNode(format!(
                "HSM {} is marked unhealthy",
                self.node()
            )));
        }

        let conn = match self.borrow().await {
            Ok(conn) => conn,
            Err(err) => {
                let stats = self.stats();
                if stats.active == 0 || self.is_closed() {
                    warn!(node = %self.node(), error = %err, "no active HSM connections, marking node unhealthy");
                    self.mark_unhealthy();
                }
                return Err(HsmError::Connection(format!(
                    "failed to execute command on HSM {}: {err}",
                    self.node()
                )));
            }
        };

        let result = conn
            .send(command, correlation_id, Some(self.inner.config.request_timeout))
            .await
            .await;

        match &result {
            Err(err) if err.is_connectivity() => {
                warn!(conn = %*conn, correlation_id, error = %err, "invalidating HSM connection");
                conn.invalidate().await;
            }
            _ => drop(conn),
        }
        result
    }

    /// Strict warm-up: every one of `min_idle` connections must be live.
    ///
    /// Marks the pool healthy on success; leaves it unhealthy and returns a
    /// connectivity error otherwise.
    pub async fn warmup_and_mark_healthy(&self) -> HsmResult<()> {
        let target = self.inner.config.min_idle.max(1);
        let mut borrowed = Vec::with_capacity(target);

        for _ in 0..target {
            let conn = match self.borrow().await {
                Ok(conn) => conn,
                Err(err) => {
                    self.mark_unhealthy();
                    error!(node = %self.node(), error = %err, "HSM warm-up failed");
                    return Err(HsmError::Connection(format!(
                        "warm-up of HSM {} failed: {err}",
                        self.node()
                    )));
                }
            };
            if !conn.is_connected() {
                self.mark_unhealthy();
                conn.invalidate().await;
                return Err(HsmError::Connection(format!(
                    "warm-up of HSM {} found a disconnected socket",
                    self.node()
                )));
            }
            debug!(conn = %*conn, "validated HSM connection during warm-up");
            borrowed.push(conn);
        }

        drop(borrowed);
        self.mark_healthy();
        info!(node = %self.node(), connections = target, "HSM pool warmed up");
        Ok(())
    }

    /// Best-effort warm-up: healthy if at least one ping succeeds.
    pub async fn warmup_with_ping(&self) -> bool {
        let (successes, attempted) = self.probe_connections().await;
        let healthy = successes > 0;
        if healthy {
            self.mark_healthy();
        } else {
            self.mark_unhealthy();
        }
        info!(
            node = %self.node(),
            successes,
            attempted,
            healthy,
            "HSM ping warm-up finished"
        );
        healthy
    }

    /// Pings up to `min_idle` connections; healthy if any ping succeeds.
    ///
    /// A pool marked healthy that holds no connections at all is reported
    /// unhealthy without probing.
    pub async fn perform_health_check(&self) -> bool {
        let stats = self.stats();
        if self.is_healthy() && stats.total == 0 {
            warn!(node = %self.node(), "healthy HSM pool holds no connections");
            return false;
        }

        let (successes, attempted) = self.probe_connections().await;
        debug!(node = %self.node(), successes, attempted, "HSM health check finished");
        successes > 0
    }

    async fn probe_connections(&self) -> (usize, usize) {
        let target = self.inner.config.min_idle.max(1);
        let mut borrowed = Vec::with_capacity(target);
        for _ in 0..target {
            match self.borrow().await {
                Ok(conn) => borrowed.push(conn),
                Err(err) => debug!(node = %self.node(), error = %err, "HSM probe could not borrow"),
            }
        }

        let mut successes = 0;
        for conn in borrowed {
            if self.probe(&conn).await {
                successes += 1;
            } else {
                conn.invalidate().await;
            }
        }
        (successes, target)
    }

    async fn probe(&self, conn: &PooledConnection) -> bool {
        if !conn.is_connected() {
            return false;
        }
        match tokio::time::timeout(self.inner.config.probe_wait, conn.ping()).await {
            Ok(Ok(response)) => !response.is_empty(),
            Ok(Err(err)) => {
                debug!(conn = %**conn, error = %err, "HSM ping failed");
                false
            }
            Err(_) => false,
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Closes every idle connection; borrowed ones close when released.
    pub async fn shutdown(&self) {
        let idle: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        self.inner.permits.close();
        for conn in idle {
            self.inner.factory.destroy(conn).await;
        }
        info!(node = %self.node(), "HSM pool shut down");
    }
}

/// RAII wrapper returning a connection to the pool on drop.
///
/// Dropping a connection whose socket died, or whose pool has closed, retires
/// it instead. Use [`PooledConnection::invalidate`] to retire it explicitly.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection, permit: OwnedSemaphorePermit) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            _permit: permit,
        }
    }

    /// Discards the connection and closes its socket.
    pub async fn invalidate(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release_slot();
            self.pool.factory.destroy(conn).await;
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection exists")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if let Some(retired) = self.pool.return_connection(conn) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { retired.close().await });
            }
        }
    }
}
