//! `netbird-relay` implements the relay subsystem of a peer-to-peer overlay
//! VPN: a TURN-like WebSocket relay that multiplexes many peer streams over
//! a single TLS connection when direct UDP traversal fails.
//!
//! See [`relay`] for the module tree.

pub mod relay;

pub use relay::error::{Error, Result};
