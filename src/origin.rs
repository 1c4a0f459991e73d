//! Origin check for terminal upgrades.

use axum::http::Uri;

use crate::error::OriginError;

/// Decides whether a browser page may open the terminal socket.
#[derive(Debug, Clone, Default)]
pub struct OriginValidator {
    allowed: Vec<String>,
}

impl OriginValidator {
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    /// With an allow-list, the origin must equal one entry (ASCII case-insensitive).
    /// Without one, the origin's `host[:port]` must equal the request's `Host`.
    pub fn validate(&self, origin: Option<&str>, host: Option<&str>) -> Result<(), OriginError> {
        let origin = origin
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .ok_or(OriginError::Missing)?;

        if !self.allowed.is_empty() {
            return if self.allowed.iter().any(|a| a.eq_ignore_ascii_case(origin)) {
                Ok(())
            } else {
                Err(OriginError::NotAllowed(origin.to_string()))
            };
        }

        let origin_host = origin_authority(origin)
            .ok_or_else(|| OriginError::Malformed(origin.to_string()))?;
        match host {
            Some(host) if host.eq_ignore_ascii_case(&origin_host) => Ok(()),
            _ => Err(OriginError::CrossOrigin {
                origin: origin.to_string(),
                host: host.unwrap_or_default().to_string(),
            }),
        }
    }
}

/// `host[:port]` of an absolute origin such as `https://example.com:8089`.
fn origin_authority(origin: &str) -> Option<String> {
    let uri: Uri = origin.parse().ok()?;
    uri.scheme()?;
    let authority = uri.authority()?.as_str();
    let host = authority.rsplit('@').next().unwrap_or(authority);
    (!host.is_empty()).then(|| host.to_string())
}
