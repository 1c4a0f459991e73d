//! Webterminal - a shell in the browser.
//!
//! Usage:
//!   webterminal [--addr 0.0.0.0:8089] [--shell sh] [--auth --username U --password P]
//!               [--allowed-origins https://a.example,https://b.example]

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use webterminal::config::{
    AuthConfig, GatewayConfig, DEFAULT_ADDR, DEFAULT_ASSETS_DIR, DEFAULT_BASE_PATH,
    DEFAULT_PASSWORD, DEFAULT_SHELL, DEFAULT_USERNAME,
};
use webterminal::http_server;
use webterminal::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "webterminal")]
#[command(about = "WebTerminal is a web-based terminal application.")]
struct Args {
    /// Server address
    #[arg(long, default_value = DEFAULT_ADDR)]
    addr: String,

    /// Enable authentication
    #[arg(long)]
    auth: bool,

    /// Authentication username
    #[arg(long, default_value = DEFAULT_USERNAME)]
    username: String,

    /// Authentication password
    #[arg(long, default_value = DEFAULT_PASSWORD)]
    password: String,

    /// Shell to use
    #[arg(long, default_value = DEFAULT_SHELL)]
    shell: PathBuf,

    /// Allowed Origin values for the terminal socket; empty = same-origin only
    #[arg(long, value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Directory with the browser UI
    #[arg(long, default_value = DEFAULT_ASSETS_DIR)]
    assets: PathBuf,

    /// URL prefix the UI is mounted under
    #[arg(long, default_value = DEFAULT_BASE_PATH)]
    base_path: String,
}

impl From<Args> for GatewayConfig {
    fn from(args: Args) -> Self {
        GatewayConfig {
            addr: args.addr,
            shell: args.shell,
            auth: AuthConfig {
                enabled: args.auth,
                username: args.username,
                password: args.password,
            },
            allowed_origins: args.allowed_origins,
            assets_dir: args.assets,
            base_path: args.base_path,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::from(Args::parse());
    config.validate().context("invalid configuration")?;

    if config.uses_default_password() {
        warn!("Authentication is enabled with the default password");
    }
    if !config.auth.enabled {
        info!("Authentication disabled");
    }
    info!(
        shell = %config.shell.display(),
        origins = ?config.allowed_origins,
        "Configured terminal gateway"
    );

    let addr = config.addr.clone();
    http_server::run_server(AppState::new(config))
        .await
        .with_context(|| format!("server on {addr} failed"))
}
