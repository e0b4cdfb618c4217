//! # Async Client API
//!
//! Purpose: One entry point that wires configuration, the codec, the load
//! balancer and the key store together.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `HsmClient` hides pools, sockets and retries.
//! 2. **Fail at Startup**: Bad config, missing keys or no reachable node stop
//!    `connect` instead of the first request.
//! 3. **Explicit Shutdown**: Background work stops only when asked.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use hsm_common::{HsmError, HsmResult, Provider, ProtocolCodec, UtimacoCodec};

use crate::balancer::LoadBalancer;
use crate::config::HsmConfig;
use crate::metrics::MetricsSnapshot;
use crate::service::HsmService;

/// Codec speaking `provider`'s wire syntax.
pub fn codec_for(provider: Provider) -> Arc<dyn ProtocolCodec> {
    match provider {
        Provider::Utimaco => Arc::new(UtimacoCodec::new()),
    }
}

/// Async HSM client.
pub struct HsmClient {
    balancer: Arc<LoadBalancer>,
    service: HsmService,
}

impl HsmClient {
    /// Validates `config`, connects to every node and waits for warm-up.
    ///
    /// **Input**: `key_blocks` is merged over `config.key_blocks`; entries
    /// passed here win on name clashes.
    /// **Output**: a ready client, or the first startup failure.
    pub async fn connect(
        mut config: HsmConfig,
        key_blocks: HashMap<String, String>,
    ) -> HsmResult<Self> {
        if !config.enabled {
            return Err(HsmError::Config("HSM integration is disabled".to_string()));
        }
        config.validate()?;

        let mut keys = std::mem::take(&mut config.key_blocks);
        keys.extend(key_blocks);
        if keys.is_empty() {
            return Err(HsmError::Config("HSM key blocks must be configured".to_string()));
        }

        let codec = codec_for(config.provider);
        let balancer = Arc::new(LoadBalancer::from_config(&config, Arc::clone(&codec)).await?);
        let service = HsmService::new(Arc::clone(&balancer), codec, Arc::new(keys));
        info!(
            provider = %config.provider,
            nodes = config.hsm_nodes.len(),
            "HSM client ready"
        );

        Ok(HsmClient { balancer, service })
    }

    pub async fn generate_visa_cavv(&self, bank_id: &str, data: &str) -> HsmResult<String> {
        self.service.generate_visa_cavv(bank_id, data).await
    }

    pub async fn generate_master_cavv(&self, bank_id: &str, data: &str) -> HsmResult<String> {
        self.service.generate_master_cavv(bank_id, data).await
    }

    pub async fn generate_hmac(&self, key_name: &str, data: &str) -> HsmResult<String> {
        self.service.generate_hmac(key_name, data).await
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.balancer.metrics()
    }

    /// Stops the health sweep and closes every socket.
    pub async fn shutdown(&self) {
        self.balancer.shutdown().await;
    }
}
