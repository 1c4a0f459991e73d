//! Shared application state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::auth::SecurityGate;
use crate::config::GatewayConfig;
use crate::origin::OriginValidator;
use crate::pty::ConnectionId;

/// Sweep interval for expired sessions, in seconds.
pub const SESSION_SWEEP_SECS: u64 = 60;

/// State handed to every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub gate: Arc<SecurityGate>,
    pub origins: Arc<OriginValidator>,
    connections: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        let gate = SecurityGate::new(&config.auth);
        let origins = OriginValidator::new(config.allowed_origins.clone());
        Self {
            config: Arc::new(config),
            gate: Arc::new(gate),
            origins: Arc::new(origins),
            connections: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.connections.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
