//! Resumable TCP tunnel.
//!
//! Two daemons share one protocol: the [`keeper`] accepts HTTP CONNECT
//! requests on a local port and the [`relay`] dials the requested target.
//! Between them, each direction of the tunnel is sequence-numbered and
//! buffered so that the short-lived carrier connection can drop and be
//! redialed at any time; a fresh carrier announces the session UUID and the
//! byte offset it has delivered, and the peer replays from there. A session
//! survives any number of carrier losses until one end sends EOF.

pub mod buffer;
pub mod keeper;
pub mod ports;
pub mod protocol;
pub mod relay;
