//! Correlation ids embedded in outbound frames.
//!
//! Format: `{prefix}_{epoch millis}_{8 hex chars}`. The millisecond stamp keeps
//! ids readable in logs, the random suffix keeps them unique within a process.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Prefix for application commands.
pub const COMMAND_ID_PREFIX: &str = "BD";
/// Prefix for health and warm-up pings.
pub const PING_ID_PREFIX: &str = "PING";

pub fn command_correlation_id() -> String {
    correlation_id(COMMAND_ID_PREFIX)
}

pub fn ping_correlation_id() -> String {
    correlation_id(PING_ID_PREFIX)
}

fn correlation_id(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{millis}_{}", &suffix[..8])
}
