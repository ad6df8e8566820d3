//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared,
//! clonable resources every route needs.

use crate::{config::Config, orchestrator::Orchestrator};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<Config>,
}
