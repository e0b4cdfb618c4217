//! # Load Balancer
//!
//! Purpose: Route each logical command to one of N node pools, retrying on the
//! next node when a node fails at the connectivity level, and keep node health
//! current with a periodic background sweep.
//!
//! ## Design Principles
//! 1. **Stable Indices**: The pool list never changes after startup, so an index
//!    identifies a node for the whole process lifetime.
//! 2. **Per-Request Attempt Set**: Each logical command tracks the nodes it has
//!    tried in its own [`AttemptedNodes`]; nothing about a retry is shared.
//! 3. **Fail Over Only on Connectivity**: Business errors from a healthy HSM are
//!    returned as-is and never touch node health.
//! 4. **Owned Sweep**: The health sweep is a task owned by the balancer and
//!    stopped by its cancellation token on shutdown.
//!
//! ## Retry Flow
//!
//! ```text
//! ATTEMPT(tries, attempted)
//!   ├─ tries == pools.len()          -> AllNodesFailed
//!   ├─ no healthy, unattempted pool  -> NoHealthyNode
//!   └─ pool.execute_command
//!        ├─ Ok                       -> done
//!        ├─ connectivity / unhealthy -> mark unhealthy, attempted += idx, tries += 1, loop
//!        └─ anything else            -> return error
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hsm_common::{HsmError, HsmResult, LoadBalancingType, ProtocolCodec};

use crate::config::HsmConfig;
use crate::factory::ConnectionFactory;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pool::ConnectionPool;
use crate::tls;

/// Cursor value past which round-robin rotation restarts from zero.
const CURSOR_RESET_THRESHOLD: usize = usize::MAX - 100_000;

/// How pools are validated before the balancer accepts traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarmupMode {
    /// Every idle connection must be live.
    #[default]
    Strict,
    /// At least one ping must succeed.
    Ping,
}

/// Balancer knobs derived from configuration.
#[derive(Debug, Clone, Copy)]
pub struct BalancerSettings {
    pub strategy: LoadBalancingType,
    pub health_check_interval: Duration,
    pub warmup: WarmupMode,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        BalancerSettings {
            strategy: LoadBalancingType::ClientSideFailover,
            health_check_interval: Duration::from_secs(30),
            warmup: WarmupMode::Strict,
        }
    }
}

/// Node indices already tried by one logical request.
#[derive(Debug, Clone)]
pub struct AttemptedNodes {
    tried: Vec<bool>,
}

impl AttemptedNodes {
    pub fn new(node_count: usize) -> Self {
        AttemptedNodes {
            tried: vec![false; node_count],
        }
    }

    pub fn insert(&mut self, idx: usize) {
        if let Some(slot) = self.tried.get_mut(idx) {
            *slot = true;
        }
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.tried.get(idx).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tried.iter().filter(|tried| **tried).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Picks the next pool index under a strategy.
pub struct NodeSelector {
    strategy: LoadBalancingType,
    cursor: AtomicUsize,
}

impl NodeSelector {
    pub fn new(strategy: LoadBalancingType) -> Self {
        NodeSelector {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> LoadBalancingType {
        self.strategy
    }

    /// Returns the next eligible index, or `None` if every node is either
    /// unhealthy or already attempted.
    pub fn select(
        &self,
        node_count: usize,
        attempted: &AttemptedNodes,
        is_healthy: impl Fn(usize) -> bool,
    ) -> Option<usize> {
        let eligible = |idx: usize| !attempted.contains(idx) && is_healthy(idx);
        match self.strategy {
            LoadBalancingType::NetworkLevel | LoadBalancingType::ClientSideFailover => {
                (0..node_count).find(|idx| eligible(*idx))
            }
            LoadBalancingType::ClientSideRoundRobin => {
                if node_count == 0 {
                    return None;
                }
                for _ in 0..node_count {
                    let idx = self.next_ticket() % node_count;
                    if eligible(idx) {
                        return Some(idx);
                    }
                }
                None
            }
        }
    }

    /// Advances the cursor, wrapping to zero near overflow in the same step.
    fn next_ticket(&self) -> usize {
        let advanced = self.cursor.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cursor| {
            let next = cursor + 1;
            Some(if next >= CURSOR_RESET_THRESHOLD { 0 } else { next })
        });
        match advanced {
            Ok(previous) | Err(previous) => previous,
        }
    }
}

/// Routes commands across node pools.
pub struct LoadBalancer {
    pools: Vec<ConnectionPool>,
    selector: NodeSelector,
    metrics: Metrics,
    cancel: CancellationToken,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl LoadBalancer {
    /// Wraps already-built pools without warming them or starting the sweep.
    pub fn new(pools: Vec<ConnectionPool>, strategy: LoadBalancingType) -> Self {
        LoadBalancer {
            pools,
            selector: NodeSelector::new(strategy),
            metrics: Metrics::new(),
            cancel: CancellationToken::new(),
            sweep: Mutex::new(None),
        }
    }

    /// Builds one pre-warmed pool per configured node, then [`LoadBalancer::start`]s.
    pub async fn from_config(config: &HsmConfig, codec: Arc<dyn ProtocolCodec>) -> HsmResult<Self> {
        let connector = match &config.tls {
            Some(tls_config) => Some(tls::build_connector(&tls_config.ca_file)?),
            None => None,
        };

        let mut pools = Vec::with_capacity(config.hsm_nodes.len());
        for node in &config.hsm_nodes {
            let mut factory = ConnectionFactory::new(
                node.clone(),
                Arc::clone(&codec),
                config.connect_timeout(),
                config.connection_settings(),
            );
            if let (Some(connector), Some(tls_config)) = (&connector, &config.tls) {
                let host = tls_config.server_name.as_deref().unwrap_or(&node.ip);
                factory = factory.with_tls(connector.clone(), tls::server_name(host)?);
            }
            pools.push(ConnectionPool::new(factory, config.pool_config()));
        }

        join_all(pools.iter().map(|pool| pool.prepare())).await;
        LoadBalancer::start(pools, config.balancer_settings()).await
    }

    /// Warms every pool and starts the health sweep.
    ///
    /// Refuses to start with `NoHealthyNode` unless at least one pool warms up.
    pub async fn start(pools: Vec<ConnectionPool>, settings: BalancerSettings) -> HsmResult<Self> {
        if pools.is_empty() {
            return Err(HsmError::Config("no HSM nodes configured".to_string()));
        }

        let warmed = join_all(pools.iter().map(|pool| warm_up(pool, settings.warmup))).await;
        let healthy = warmed.iter().filter(|ok| **ok).count();
        if healthy == 0 {
            error!(nodes = pools.len(), "no HSM node passed warm-up");
            join_all(pools.iter().map(|pool| pool.shutdown())).await;
            return Err(HsmError::NoHealthyNode(
                "no healthy HSM nodes available at startup".to_string(),
            ));
        }
        info!(healthy, total = pools.len(), strategy = ?settings.strategy, "HSM load balancer started");

        let balancer = LoadBalancer::new(pools, settings.strategy);
        balancer.spawn_health_sweep(settings.health_check_interval);
        Ok(balancer)
    }

    pub fn pools(&self) -> &[ConnectionPool] {
        &self.pools
    }

    pub fn healthy_count(&self) -> usize {
        self.pools.iter().filter(|pool| pool.is_healthy()).count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Runs `command` on the first node that accepts it.
    pub async fn execute_command(&self, command: &str, correlation_id: &str) -> HsmResult<String> {
        self.metrics.record_request_start();
        let started = Instant::now();
        let result = self.route(command, correlation_id).await;
        self.metrics.record_request_end(started.elapsed());
        if result.is_err() {
            self.metrics.record_error();
        }
        result
    }

    async fn route(&self, command: &str, correlation_id: &str) -> HsmResult<String> {
        let total = self.pools.len();
        let mut attempted = AttemptedNodes::new(total);
        let mut last_error: Option<HsmError> = None;
        let mut tries = 0;

        loop {
            if tries >= total {
                let cause = last_error.map(|err| err.to_string()).unwrap_or_default();
                return Err(HsmError::AllNodesFailed(format!(
                    "tried all {total} HSM nodes, last error: {cause}"
                )));
            }

            let Some(idx) = self
                .selector
                .select(total, &attempted, |idx| self.pools[idx].is_healthy())
            else {
                return Err(HsmError::NoHealthyNode(format!(
                    "no healthy HSM node left after {tries} attempt(s)"
                )));
            };

            let pool = &self.pools[idx];
            debug!(node = %pool.node(), correlation_id, attempt = tries + 1, "routing HSM command");
            match pool.execute_command(command, correlation_id).await {
                Ok(payload) => return Ok(payload),
                Err(err) if err.should_fail_over() => {
                    warn!(
                        node = %pool.node(),
                        correlation_id,
                        attempt = tries + 1,
                        error = %err,
                        "HSM node failed, marking unhealthy and trying next node"
                    );
                    pool.mark_unhealthy();
                    attempted.insert(idx);
                    tries += 1;
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn spawn_health_sweep(&self, period: Duration) {
        let pools = self.pools.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sweep(&pools) => {}
                }
            }
            debug!("HSM health sweep stopped");
        });
        *self.sweep.lock() = Some(task);
    }

    /// Probes every pool once and flips health flags in both directions.
    ///
    /// Returns the number of healthy pools afterwards.
    pub async fn run_health_sweep(&self) -> usize {
        sweep(&self.pools).await
    }

    /// Stops the health sweep and shuts down every pool.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.sweep.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        join_all(self.pools.iter().map(|pool| pool.shutdown())).await;
        info!("HSM load balancer shut down");
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn warm_up(pool: &ConnectionPool, mode: WarmupMode) -> bool {
    match mode {
        WarmupMode::Strict => match pool.warmup_and_mark_healthy().await {
            Ok(()) => true,
            Err(err) => {
                error!(node = %pool.node(), error = %err, "error warming up HSM node");
                pool.mark_unhealthy();
                false
            }
        },
        WarmupMode::Ping => pool.warmup_with_ping().await,
    }
}

async fn sweep(pools: &[ConnectionPool]) -> usize {
    let results = join_all(pools.iter().map(|pool| pool.perform_health_check())).await;

    for (pool, passed) in pools.iter().zip(results) {
        if passed && !pool.is_healthy() {
            pool.mark_healthy();
            info!(node = %pool.node(), "HSM node recovered, marked healthy");
        } else if !passed && pool.is_healthy() {
            pool.mark_unhealthy();
            warn!(node = %pool.node(), "HSM node failed health check, marked unhealthy");
        }
        info!(node = %pool.node(), healthy = pool.is_healthy(), stats = %pool.stats(), "HSM pool stats");
    }

    let healthy = pools.iter().filter(|pool| pool.is_healthy()).count();
    info!(healthy, total = pools.len(), "HSM health sweep finished");
    healthy
}
