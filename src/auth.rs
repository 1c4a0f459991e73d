//! Session cookies, Basic credentials and per-IP rate limiting.
//!
//! All state lives in one [`GateState`] behind a single lock; every check is a
//! complete check-and-update under that lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::AuthError;

pub const SESSION_COOKIE: &str = "session_id";
/// Sliding session lifetime.
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 60);
pub const MAX_FAILED_ATTEMPTS: u32 = 5;
pub const BLOCK_DURATION: Duration = Duration::from_secs(5 * 60);

/// The parts of a request the gate looks at.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    pub session_id: Option<&'a str>,
    pub client_ip: &'a str,
    pub authorization: Option<&'a str>,
}

/// A live session to hand (back) to the client as a cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub id: String,
}

impl SessionTicket {
    /// `Set-Cookie` value scoped to `path`.
    pub fn cookie(&self, path: &str, secure: bool) -> String {
        let mut cookie = format!(
            "{SESSION_COOKIE}={}; Path={path}; Max-Age={}; HttpOnly; SameSite=Strict",
            self.id,
            SESSION_TTL.as_secs()
        );
        if secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// A live session cookie was presented and refreshed.
    Session(SessionTicket),
    /// Credentials were accepted and a new session was created.
    Issued(SessionTicket),
}

impl Admission {
    /// The session to re-send, so the browser's cookie lifetime slides
    /// together with the server-side expiry.
    pub fn ticket(&self) -> &SessionTicket {
        match self {
            Admission::Session(ticket) | Admission::Issued(ticket) => ticket,
        }
    }
}

#[derive(Debug, Default)]
struct RateLimit {
    failures: u32,
    blocked_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct GateState {
    sessions: HashMap<String, Instant>,
    limits: HashMap<String, RateLimit>,
}

impl GateState {
    fn refresh_session(&mut self, id: &str, now: Instant) -> bool {
        match self.sessions.get_mut(id) {
            Some(expiry) if now < *expiry => {
                *expiry = now + SESSION_TTL;
                true
            }
            _ => false,
        }
    }

    fn blocked_for(&self, ip: &str, now: Instant) -> Option<Duration> {
        self.limits
            .get(ip)
            .and_then(|limit| limit.blocked_until)
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    fn record_failure(&mut self, ip: &str, now: Instant) -> u32 {
        let limit = self.limits.entry(ip.to_string()).or_default();
        limit.failures += 1;
        if limit.failures >= MAX_FAILED_ATTEMPTS {
            limit.blocked_until = Some(now + BLOCK_DURATION);
        }
        limit.failures
    }

    fn clear_failures(&mut self, ip: &str) {
        self.limits.remove(ip);
    }

    fn issue_session(&mut self, now: Instant) -> SessionTicket {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.sessions.insert(id.clone(), now + SESSION_TTL);
        SessionTicket { id }
    }
}

/// Gatekeeper run before routing whenever authentication is enabled.
pub struct SecurityGate {
    username: String,
    password: String,
    state: Mutex<GateState>,
}

impl SecurityGate {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
            state: Mutex::new(GateState::default()),
        }
    }

    pub async fn check(&self, req: &AuthRequest<'_>) -> Result<Admission, AuthError> {
        self.check_at(req, Instant::now()).await
    }

    /// Evaluate `req` as if it arrived at `now`.
    pub async fn check_at(
        &self,
        req: &AuthRequest<'_>,
        now: Instant,
    ) -> Result<Admission, AuthError> {
        let mut state = self.state.lock().await;

        if let Some(id) = req.session_id {
            if state.refresh_session(id, now) {
                return Ok(Admission::Session(SessionTicket { id: id.to_string() }));
            }
        }

        let ip = req.client_ip;
        if let Some(remaining) = state.blocked_for(ip, now) {
            let retry_after_secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            debug!(ip, retry_after_secs, "Blocked client");
            return Err(AuthError::RateLimited { retry_after_secs });
        }

        let Some(header) = req.authorization else {
            return Err(AuthError::Challenge);
        };

        if !self.credentials_match(header) {
            let failures = state.record_failure(ip, now);
            if failures >= MAX_FAILED_ATTEMPTS {
                warn!(ip, failures, "Too many failed logins, blocking client");
            } else {
                warn!(ip, failures, "Failed login");
            }
            return Err(AuthError::InvalidCredentials);
        }

        state.clear_failures(ip);
        let session = state.issue_session(now);
        info!(ip, "Issued session");
        Ok(Admission::Issued(session))
    }

    /// Drop sessions that have already expired. Returns how many were removed.
    pub async fn prune_expired(&self, now: Instant) -> usize {
        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state.sessions.retain(|_, expiry| now < *expiry);
        before - state.sessions.len()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    fn credentials_match(&self, header: &str) -> bool {
        match decode_basic(header) {
            Some((user, pass)) => user == self.username && pass == self.password,
            None => false,
        }
    }
}

/// Decode an `Authorization: Basic ...` value into `(username, password)`.
pub fn decode_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.split_once(' ')?;
    if scheme != "Basic" {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Value of the session cookie in a `Cookie` header, if present.
pub fn session_cookie<'a, I>(cookie_headers: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    cookie_headers
        .into_iter()
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
}
