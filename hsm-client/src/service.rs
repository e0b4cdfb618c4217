//! # HSM Service
//!
//! Purpose: Turn the three named cryptographic operations into wire commands
//! and submit them through the load balancer.
//!
//! ## Design Principles
//! 1. **Keys Before I/O**: Key material is resolved first; a missing key never
//!    reaches a socket.
//! 2. **Fresh Correlation Id**: Every submission gets its own id, so a retry on
//!    another node is matched independently.
//! 3. **Narrow Seams**: Key storage and wire syntax come in as traits.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use hsm_common::{command_correlation_id, HsmError, HsmResult, ProtocolCodec};

use crate::balancer::LoadBalancer;

pub const VISA_SCHEME: &str = "VISA";
pub const MASTERCARD_SCHEME: &str = "MASTERCARD";

/// Source of key blocks by key name.
pub trait KeyLookup: Send + Sync + 'static {
    fn key_block(&self, key_name: &str) -> Option<String>;
}

impl KeyLookup for HashMap<String, String> {
    fn key_block(&self, key_name: &str) -> Option<String> {
        self.get(key_name).cloned()
    }
}

/// Key name for a bank's CAVV generation key, e.g. `HDFC_VISA_CAVV_GEN`.
pub fn cavv_key_name(bank_id: &str, scheme: &str) -> String {
    format!("{}_{}_CAVV_GEN", bank_id.to_uppercase(), scheme)
}

pub struct HsmService {
    balancer: Arc<LoadBalancer>,
    codec: Arc<dyn ProtocolCodec>,
    keys: Arc<dyn KeyLookup>,
}

impl HsmService {
    pub fn new(
        balancer: Arc<LoadBalancer>,
        codec: Arc<dyn ProtocolCodec>,
        keys: Arc<dyn KeyLookup>,
    ) -> Self {
        HsmService {
            balancer,
            codec,
            keys,
        }
    }

    pub async fn generate_visa_cavv(&self, bank_id: &str, data: &str) -> HsmResult<String> {
        let key_block = self.lookup(&cavv_key_name(bank_id, VISA_SCHEME))?;
        let command = self.codec.build_visa_cavv_command(&key_block, data);
        self.submit(&command).await
    }

    pub async fn generate_master_cavv(&self, bank_id: &str, data: &str) -> HsmResult<String> {
        let key_block = self.lookup(&cavv_key_name(bank_id, MASTERCARD_SCHEME))?;
        let command = self.codec.build_master_cavv_command(&key_block, data);
        self.submit(&command).await
    }

    pub async fn generate_hmac(&self, key_name: &str, data: &str) -> HsmResult<String> {
        let key_block = self.lookup(key_name)?;
        let command = self.codec.build_hmac_command(&key_block, data);
        self.submit(&command).await
    }

    fn lookup(&self, key_name: &str) -> HsmResult<String> {
        self.keys
            .key_block(key_name)
            .ok_or_else(|| HsmError::KeyNotFound(format!("no key block configured for {key_name}")))
    }

    async fn submit(&self, command: &str) -> HsmResult<String> {
        let correlation_id = command_correlation_id();
        debug!(correlation_id = %correlation_id, "submitting HSM command");
        self.balancer.execute_command(command, &correlation_id).await
    }
}
