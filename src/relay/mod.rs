//! This module contains the implementation details of the relay.
//!
//! Leaves first: [`codec`] and [`auth`] are pure/stateless, [`healthcheck`]
//! is a small standalone engine used by both [`server`] and [`client`].

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod metrics;
pub mod server;

/// Wire protocol version understood by this crate. Handshakes with a
/// mismatched version are rejected; other frame types with a mismatched
/// version are processed leniently and merely logged (see
/// [`codec::determine_client_msg_type`] call sites in [`server::peer`]).
pub const CURRENT_PROTOCOL_VERSION: u8 = 1;

/// Maximum transport payload size, chosen to fit one WireGuard packet
/// inside the framing overhead.
pub const BUFFER_SIZE: usize = 8820;
