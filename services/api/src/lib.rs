//! Parley API Library Crate
//!
//! The session layer on top of `parley-core`: admission and lifecycle of
//! sessions, the track tasks that bridge media and handlers, a WebSocket
//! media transport, and the HTTP routes. The binaries are thin wrappers
//! around this library.

pub mod audio_utils;
pub mod config;
pub mod demo;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod router;
pub mod state;
pub mod tracks;
pub mod transport;
pub mod ws;

#[cfg(test)]
pub(crate) mod test_support;
