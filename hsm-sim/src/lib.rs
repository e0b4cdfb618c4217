//! # HSM Simulator
//!
//! Purpose: Speak the Utimaco-style text protocol over TCP so the driver can
//! be exercised end to end without hardware.
//!
//! ## Design Principles
//! 1. **Protocol Fidelity**: Frames, tags and response codes match what the
//!    client codec expects, including echoed context tags.
//! 2. **Scriptable Faults**: A [`Behavior`] switch injects the failure modes the
//!    driver must survive (dropped sockets, silence, garbage, rejections, delays, reordering).
//! 3. **No Cryptography**: Payloads are a deterministic digest of the request,
//!    good enough to assert routing but meaningless as key material.

mod server;

pub use server::{Behavior, SimServer};
