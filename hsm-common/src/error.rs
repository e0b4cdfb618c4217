//! # Error Model
//!
//! Purpose: A single tagged error type shared by the codec, the dispatcher,
//! the pools and the load balancer.
//!
//! ## Design Principles
//! 1. **Tag, Not Type**: Callers branch on [`ErrorKind`] instead of matching
//!    message text or concrete variants.
//! 2. **Cloneable**: One socket failure may resolve many pending requests, so
//!    the error carries owned strings instead of `io::Error`.
//! 3. **Routing Helpers**: [`HsmError::is_connectivity`] drives connection
//!    invalidation, [`HsmError::should_fail_over`] drives node retry.

use std::io;

use thiserror::Error;

/// Result alias used across the workspace.
pub type HsmResult<T> = Result<T, HsmError>;

/// Coarse classification of an [`HsmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connectivity,
    Io,
    Shutdown,
    Protocol,
    Command,
    Timeout,
    KeyNotFound,
    UnhealthyNode,
    NoHealthyNode,
    AllNodesFailed,
    Config,
    Rejected,
    Unexpected,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HsmError {
    /// Socket not connected, connect refused or timed out, stream closed mid-read.
    #[error("connection error: {0}")]
    Connection(String),
    /// Write or read failure on an established stream.
    #[error("i/o error: {0}")]
    Io(String),
    /// The connection or its dispatcher was shut down with the request in flight.
    #[error("socket shutdown: {0}")]
    SocketShutdown(String),
    /// Frame could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The HSM rejected the command.
    #[error("command error: {0}")]
    Command(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("unhealthy node: {0}")]
    UnhealthyNode(String),
    #[error("no healthy HSM node available: {0}")]
    NoHealthyNode(String),
    #[error("all HSM nodes failed: {0}")]
    AllNodesFailed(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The request was refused locally before reaching the wire.
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl HsmError {
    /// Returns the classification tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HsmError::Connection(_) => ErrorKind::Connectivity,
            HsmError::Io(_) => ErrorKind::Io,
            HsmError::SocketShutdown(_) => ErrorKind::Shutdown,
            HsmError::Protocol(_) => ErrorKind::Protocol,
            HsmError::Command(_) => ErrorKind::Command,
            HsmError::Timeout(_) => ErrorKind::Timeout,
            HsmError::KeyNotFound(_) => ErrorKind::KeyNotFound,
            HsmError::UnhealthyNode(_) => ErrorKind::UnhealthyNode,
            HsmError::NoHealthyNode(_) => ErrorKind::NoHealthyNode,
            HsmError::AllNodesFailed(_) => ErrorKind::AllNodesFailed,
            HsmError::Config(_) => ErrorKind::Config,
            HsmError::Rejected(_) => ErrorKind::Rejected,
            HsmError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// True when the socket behind the request can no longer be trusted.
    ///
    /// A pool invalidates the connection on these instead of returning it.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connectivity | ErrorKind::Io | ErrorKind::Shutdown
        )
    }

    /// True when the load balancer should demote the node and try the next one.
    pub fn should_fail_over(&self) -> bool {
        self.is_connectivity() || self.kind() == ErrorKind::UnhealthyNode
    }
}

impl From<io::Error> for HsmError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::AddrNotAvailable => HsmError::Connection(err.to_string()),
            io::ErrorKind::TimedOut => HsmError::Connection(format!("timed out: {err}")),
            _ => HsmError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_tags() {
        assert!(HsmError::Connection("x".into()).is_connectivity());
        assert!(HsmError::Io("x".into()).is_connectivity());
        assert!(HsmError::SocketShutdown("x".into()).is_connectivity());
        assert!(!HsmError::Timeout("x".into()).is_connectivity());
        assert!(!HsmError::Command("x".into()).is_connectivity());
        assert!(!HsmError::KeyNotFound("x".into()).is_connectivity());
    }

    #[test]
    fn fail_over_covers_unhealthy_node_only_beyond_connectivity() {
        assert!(HsmError::UnhealthyNode("x".into()).should_fail_over());
        assert!(HsmError::Io("x".into()).should_fail_over());
        assert!(!HsmError::Timeout("x".into()).should_fail_over());
        assert!(!HsmError::Protocol("x".into()).should_fail_over());
        assert!(!HsmError::Rejected("x".into()).should_fail_over());
    }

    #[test]
    fn maps_io_errors_by_kind() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(HsmError::from(refused).kind(), ErrorKind::Connectivity);

        let other = io::Error::new(io::ErrorKind::Other, "disk on fire");
        assert_eq!(HsmError::from(other).kind(), ErrorKind::Io);
    }
}
