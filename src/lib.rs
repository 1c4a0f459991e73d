//! Webterminal - exposes a shell on a pseudo-terminal to browsers over WebSocket.
//!
//! Every upgraded connection gets its own shell process. Requests pass through
//! an optional security gate (Basic credentials, sliding session cookie, per-IP
//! lockout) and upgrades are checked against the configured origins.

#[cfg(not(target_os = "linux"))]
compile_error!("webterminal only works on Linux.");

pub mod auth;
pub mod config;
pub mod error;
pub mod http_server;
pub mod origin;
pub mod pty;
pub mod relay;
pub mod state;
