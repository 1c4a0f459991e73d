//! Gateway configuration, built once at startup and shared read-only.

use std::path::PathBuf;

use crate::error::ConfigError;

pub const DEFAULT_ADDR: &str = "0.0.0.0:8089";
pub const DEFAULT_SHELL: &str = "sh";
pub const DEFAULT_BASE_PATH: &str = "/xterm";
pub const DEFAULT_ASSETS_DIR: &str = "static";
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "password";

/// Credentials checked by the security gate.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: DEFAULT_USERNAME.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
        }
    }
}

/// Everything the gateway needs to serve requests.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address, `host:port`.
    pub addr: String,
    /// Shell program launched for every terminal connection.
    pub shell: PathBuf,
    pub auth: AuthConfig,
    /// Origins allowed to open the terminal socket. Empty means same-origin only.
    pub allowed_origins: Vec<String>,
    /// Directory holding the browser UI, served under the base path.
    pub assets_dir: PathBuf,
    /// Mount point of the UI, without trailing slash.
    pub base_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            shell: PathBuf::from(DEFAULT_SHELL),
            auth: AuthConfig::default(),
            allowed_origins: Vec::new(),
            assets_dir: PathBuf::from(DEFAULT_ASSETS_DIR),
            base_path: DEFAULT_BASE_PATH.to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shell.as_os_str().is_empty() {
            return Err(ConfigError::EmptyShell);
        }
        let base = self.base_path.as_str();
        if !base.starts_with('/') || base.ends_with('/') {
            return Err(ConfigError::BasePath(base.to_string()));
        }
        if self.allowed_origins.iter().any(|o| o.trim().is_empty()) {
            return Err(ConfigError::EmptyOrigin);
        }
        Ok(())
    }

    /// Base path with the trailing separator, e.g. `/xterm/`.
    pub fn canonical_base(&self) -> String {
        format!("{}/", self.base_path)
    }

    /// Path of the WebSocket upgrade endpoint.
    pub fn terminal_path(&self) -> String {
        format!("{}/webterminal", self.base_path)
    }

    pub fn uses_default_password(&self) -> bool {
        self.auth.enabled && self.auth.password == DEFAULT_PASSWORD
    }
}
