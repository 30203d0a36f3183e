//! WireSocket Core Library
//!
//! Shared building blocks for the WireSocket services: the WireGuard
//! backend abstraction (kernel and userspace), key handling, the wire
//! protocol types exchanged between agent, tunnel node, and auth
//! service, and the HTTP client the agent uses to log in to a tunnel.

pub mod backend;
pub mod client;
pub mod error;
pub mod keys;
pub mod proto;
pub mod service;
pub mod shell;

pub use error::{CoreError, Result};

/// Largest payload a single UDP datagram (and therefore a single binary
/// WebSocket frame) can carry through the tunnel.
pub const MAX_DATAGRAM: usize = 65535;
