// hsm-common - Shared types and wire protocol definitions for the HSM driver
//
// This crate stays free of I/O so codecs and error tags can be tested in isolation.

pub mod correlation;
pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use correlation::*;
pub use error::*;
pub use protocol::*;
pub use types::*;
