//! # HSM Async Client
//!
//! Purpose: Drive CAVV and HMAC generation on one or more HSM nodes over a
//! tag-correlated, line-delimited socket protocol, with pooled sockets,
//! per-request timeouts and failover across nodes.
//!
//! ## Design Principles
//! 1. **One Reader per Socket**: Each connection owns a single read-loop task;
//!    callers only ever write.
//! 2. **Tag-Correlated Completion**: Responses are matched by correlation id,
//!    never by arrival order.
//! 3. **Object Pool Pattern**: Sockets are reused per node and retired on
//!    connectivity failures.
//! 4. **Tagged Errors**: Retry and invalidation decisions read `ErrorKind`.
//!
//! ## Layers
//!
//! ```text
//! HsmClient -> HsmService -> LoadBalancer -> ConnectionPool (per node)
//!                                               -> Connection -> ResponseDispatcher
//! ```

mod balancer;
mod client;
mod config;
mod connection;
mod dispatcher;
mod factory;
mod metrics;
mod pool;
mod service;
mod tls;

pub use balancer::{AttemptedNodes, BalancerSettings, LoadBalancer, NodeSelector, WarmupMode};
pub use client::{codec_for, HsmClient};
pub use config::{HsmConfig, TlsConfig};
pub use connection::{BoxedStream, Connection, ConnectionSettings, HsmStream};
pub use dispatcher::{ResponseDispatcher, ResponseHandle, DEFAULT_REQUEST_TIMEOUT};
pub use factory::ConnectionFactory;
pub use metrics::{LatencySnapshot, Metrics, MetricsSnapshot};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use service::{cavv_key_name, HsmService, KeyLookup, MASTERCARD_SCHEME, VISA_SCHEME};

pub use hsm_common::{ErrorKind, HsmError, HsmResult, LoadBalancingType, Node, Provider};
