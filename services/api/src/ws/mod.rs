//! WebSocket Transport
//!
//! A [`PeerConnection`](crate::transport::PeerConnection) implementation over
//! a single WebSocket per session. It is structured into submodules:
//!
//! - `protocol`: The JSON text frames exchanged with the client.
//! - `peer`: The peer connection, its data channel and the socket loop.
//! - `session`: The axum upgrade handler that offers the socket to the orchestrator.

pub mod peer;
pub mod protocol;
pub mod session;

pub use session::ws_handler;
