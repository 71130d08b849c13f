//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::tunnel::session::TunnelSlot;

/// Shared state for the relay server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// The one tunnel session, if a client is connected.
    pub tunnel: TunnelSlot,
    /// Monotonic instant when the server started.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            tunnel: TunnelSlot::new(),
            start_time: Instant::now(),
        }
    }
}
