//! Error types surfaced at the gateway's boundaries.

use std::io;
use std::path::PathBuf;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Realm advertised in the Basic challenge.
pub const AUTH_REALM: &str = r#"Basic realm="Restricted""#;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("shell path must not be empty")]
    EmptyShell,
    #[error("base path {0:?} must start with '/', must not end with '/' and must not be the root")]
    BasePath(String),
    #[error("allowed origin entries must not be blank")]
    EmptyOrigin,
}

/// The shell or its pseudo-terminal could not be created.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to allocate pseudo-terminal: {0}")]
    Openpty(#[source] io::Error),
    #[error("failed to configure pseudo-terminal: {0}")]
    Configure(#[source] io::Error),
    #[error("failed to launch {shell:?}: {source}")]
    Exec {
        shell: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why the security gate refused a request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No credentials presented; the client should prompt and retry.
    #[error("authentication required")]
    Challenge,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("too many failed attempts, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let mut res = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        let headers = res.headers_mut();
        match self {
            AuthError::Challenge | AuthError::InvalidCredentials => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(AUTH_REALM),
                );
            }
            AuthError::RateLimited { retry_after_secs } => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            }
        }
        res
    }
}

/// Why a terminal upgrade was refused by the origin check.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginError {
    #[error("missing Origin header")]
    Missing,
    #[error("malformed origin {0:?}")]
    Malformed(String),
    #[error("origin {0:?} is not in the allow-list")]
    NotAllowed(String),
    #[error("origin {origin:?} does not match host {host:?}")]
    CrossOrigin { origin: String, host: String },
}

impl IntoResponse for OriginError {
    fn into_response(self) -> Response {
        (StatusCode::FORBIDDEN, "Forbidden").into_response()
    }
}
