//! HTTP server implementation using Axum.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        ConnectInfo, Request, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use tokio::time::interval;
use tower::ServiceExt;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::auth::{self, AuthRequest, SecurityGate};
use crate::error::AuthError;
use crate::relay;
use crate::state::{AppState, SESSION_SWEEP_SECS};

/// Build the gateway router: security gate, redirects, terminal socket, assets.
pub fn router(state: AppState) -> Router {
    let base = state.config.base_path.clone();
    let terminal = state.config.terminal_path();

    Router::new()
        .route("/", any(redirect_to_base))
        .route(&base, any(redirect_to_base))
        .route(&terminal, get(terminal_socket))
        .fallback(serve_asset)
        .layer(middleware::from_fn_with_state(state.clone(), security_gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the configured address and serve until Ctrl-C / SIGTERM.
pub async fn run_server(state: AppState) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind(&state.config.addr).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);

    if state.config.auth.enabled {
        spawn_session_sweeper(state.gate.clone());
    }

    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
}

async fn security_gate(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.config.auth.enabled {
        return next.run(req).await;
    }

    let headers = req.headers();
    let session_id = auth::session_cookie(
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok()),
    )
    .map(str::to_owned);
    // A non-UTF-8 Authorization header still counts as a presented credential.
    let authorization = headers
        .get(header::AUTHORIZATION)
        .map(|v| v.to_str().unwrap_or_default().to_owned());
    let ip = client_ip(&req);
    let secure = is_secure_request(&req);

    let auth_req = AuthRequest {
        session_id: session_id.as_deref(),
        client_ip: &ip,
        authorization: authorization.as_deref(),
    };
    match state.gate.check(&auth_req).await {
        Ok(admission) => {
            let cookie = admission.ticket().cookie(&state.config.base_path, secure);
            let mut res = next.run(req).await;
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    res.headers_mut().append(header::SET_COOKIE, value);
                }
                Err(e) => warn!(error = %e, "Could not encode session cookie"),
            }
            res
        }
        Err(e @ AuthError::Challenge) => {
            debug!(ip = %ip, path = %req.uri().path(), "Requesting credentials");
            e.into_response()
        }
        Err(e) => {
            warn!(ip = %ip, path = %req.uri().path(), error = %e, "Rejected request");
            e.into_response()
        }
    }
}

async fn redirect_to_base(State(state): State<AppState>) -> Response {
    let location = state.config.canonical_base();
    match HeaderValue::from_str(&location) {
        Ok(location) => (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn terminal_socket(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if let Err(e) = state.origins.validate(origin, host) {
        warn!(error = %e, "Rejected terminal upgrade");
        return e.into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let conn = state.next_connection_id();
    let shell = state.config.shell.clone();
    info!(%conn, "Terminal connection accepted");
    ws.on_upgrade(move |socket| async move {
        relay::serve(socket, &shell, conn).await;
    })
}

/// Serve UI files rooted at the canonical base path.
async fn serve_asset(State(state): State<AppState>, mut req: Request) -> Response {
    let prefix = state.config.canonical_base();
    let rewritten = match req.uri().path().strip_prefix(prefix.as_str()) {
        Some(rest) => match req.uri().query() {
            Some(query) => format!("/{rest}?{query}"),
            None => format!("/{rest}"),
        },
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    match rewritten.parse::<Uri>() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    }

    match ServeDir::new(&state.config.assets_dir).oneshot(req).await {
        Ok(res) => res.into_response(),
        Err(never) => match never {},
    }
}

/// First `X-Forwarded-For` entry, else the peer address.
fn client_ip(req: &Request) -> String {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn is_secure_request(req: &Request) -> bool {
    if req.uri().scheme_str() == Some("https") {
        return true;
    }
    req.headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

fn spawn_session_sweeper(gate: Arc<SecurityGate>) {
    tokio::spawn(async move {
        let mut interval = interval(Duration::from_secs(SESSION_SWEEP_SECS));
        loop {
            interval.tick().await;
            let removed = gate.prune_expired(Instant::now()).await;
            if removed > 0 {
                info!(removed, "Pruned expired sessions");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MAX_FAILED_ATTEMPTS, SESSION_COOKIE};
    use crate::config::{AuthConfig, GatewayConfig};
    use crate::error::AUTH_REALM;
    use axum::body::Body;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use futures_util::{SinkExt, StreamExt};
    use std::path::PathBuf;
    use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};

    fn config_with_auth(enabled: bool) -> GatewayConfig {
        GatewayConfig {
            shell: PathBuf::from("/bin/sh"),
            auth: AuthConfig {
                enabled,
                username: "admin".into(),
                password: "s3cret".into(),
            },
            ..GatewayConfig::default()
        }
    }

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))
    }

    fn get(uri: &str) -> axum::http::request::Builder {
        axum::http::Request::builder()
            .uri(uri)
            .header(header::HOST, "example.com:8089")
    }

    fn upgrade(uri: &str, origin: &str) -> axum::http::Request<Body> {
        get(uri)
            .header(header::ORIGIN, origin)
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(res: Response) -> String {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn asset_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>terminal</h1>").unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();
        dir
    }

    #[tokio::test]
    async fn root_and_bare_base_redirect_permanently() {
        let app = router(AppState::new(config_with_auth(false)));
        for uri in ["/", "/xterm"] {
            let res = app
                .clone()
                .oneshot(get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::MOVED_PERMANENTLY, "{uri}");
            assert_eq!(res.headers()[header::LOCATION], "/xterm/");
        }
    }

    #[tokio::test]
    async fn serves_assets_under_base_path() {
        let dir = asset_dir();
        let config = GatewayConfig {
            assets_dir: dir.path().to_path_buf(),
            ..config_with_auth(false)
        };
        let app = router(AppState::new(config));

        let res = app
            .clone()
            .oneshot(get("/xterm/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_text(res).await, "<h1>terminal</h1>");

        let res = app
            .clone()
            .oneshot(get("/xterm/app.js?v=2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_text(res).await, "console.log(1)");

        for uri in ["/app.js", "/xterm/missing.css", "/other/index.html"] {
            let res = app
                .clone()
                .oneshot(get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn custom_base_path_moves_every_route() {
        let config = GatewayConfig {
            base_path: "/console".into(),
            ..config_with_auth(false)
        };
        let app = router(AppState::new(config));
        let res = app
            .clone()
            .oneshot(get("/console").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.headers()[header::LOCATION], "/console/");

        let res = app
            .oneshot(upgrade("/console/webterminal", "https://evil.example"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn challenge_when_no_credentials() {
        let app = router(AppState::new(config_with_auth(true)));
        let res = app
            .oneshot(get("/xterm/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.headers()[header::WWW_AUTHENTICATE], AUTH_REALM);
    }

    #[tokio::test]
    async fn login_issues_cookie_that_authenticates_later_requests() {
        let app = router(AppState::new(config_with_auth(true)));
        let res = app
            .clone()
            .oneshot(
                get("/")
                    .header(header::AUTHORIZATION, basic("admin", "s3cret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::MOVED_PERMANENTLY);
        let cookie = res.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with(&format!("{SESSION_COOKIE}=")));
        assert!(cookie.contains("; Path=/xterm"));
        assert!(cookie.contains("; HttpOnly"));
        assert!(cookie.contains("; SameSite=Strict"));
        assert!(cookie.contains("; Max-Age=1800"));
        assert!(!cookie.contains("Secure"));

        let pair = cookie.split(';').next().unwrap().to_string();
        let res = app
            .oneshot(get("/xterm").header(header::COOKIE, pair).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::MOVED_PERMANENTLY);
        // Each authenticated request re-sends the cookie so its Max-Age slides.
        assert_eq!(res.headers()[header::SET_COOKIE].to_str().unwrap(), cookie);
    }

    #[tokio::test]
    async fn cookie_is_secure_behind_tls_proxy() {
        let app = router(AppState::new(config_with_auth(true)));
        let res = app
            .oneshot(
                get("/")
                    .header(header::AUTHORIZATION, basic("admin", "s3cret"))
                    .header("x-forwarded-proto", "HTTPS")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let cookie = res.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.ends_with("; Secure"));
    }

    #[tokio::test]
    async fn repeated_failures_block_the_forwarded_ip() {
        let app = router(AppState::new(config_with_auth(true)));
        let attempt = |auth: String, ip: &'static str| {
            get("/xterm/")
                .header(header::AUTHORIZATION, auth)
                .header("x-forwarded-for", ip)
                .body(Body::empty())
                .unwrap()
        };

        for _ in 0..MAX_FAILED_ATTEMPTS {
            let res = app
                .clone()
                .oneshot(attempt(basic("admin", "guess"), "198.51.100.9, 10.0.0.1"))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
            assert!(res.headers().get(header::RETRY_AFTER).is_none());
        }

        let res = app
            .clone()
            .oneshot(attempt(basic("admin", "s3cret"), "198.51.100.9"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let retry: u64 = res.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry > 0 && retry <= 300);

        let res = app
            .oneshot(attempt(basic("admin", "s3cret"), "192.0.2.44"))
            .await
            .unwrap();
        assert_ne!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn gate_runs_before_the_upgrade() {
        let app = router(AppState::new(config_with_auth(true)));
        for origin in ["http://example.com:8089", "https://evil.example"] {
            let res = app
                .clone()
                .oneshot(upgrade("/xterm/webterminal", origin))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::UNAUTHORIZED, "{origin}");
        }
    }

    #[tokio::test]
    async fn cross_origin_upgrade_is_forbidden() {
        let app = router(AppState::new(config_with_auth(false)));
        let res = app
            .oneshot(upgrade("/xterm/webterminal", "https://evil.example"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn upgrade_without_origin_is_forbidden() {
        let app = router(AppState::new(config_with_auth(false)));
        let res = app
            .oneshot(get("/xterm/webterminal").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    async fn spawn_gateway(config: GatewayConfig) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(AppState::new(config));
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    fn ws_request(
        addr: SocketAddr,
        origin: &str,
        auth: Option<&str>,
    ) -> tungstenite::handshake::client::Request {
        let mut req = format!("ws://{addr}/xterm/webterminal")
            .into_client_request()
            .unwrap();
        req.headers_mut().insert("origin", origin.parse().unwrap());
        if let Some(auth) = auth {
            req.headers_mut().insert("authorization", auth.parse().unwrap());
        }
        req
    }

    #[tokio::test]
    async fn terminal_round_trip_over_websocket() {
        let addr = spawn_gateway(config_with_auth(true)).await;
        let auth = basic("admin", "s3cret");
        let (mut socket, _) = tokio_tungstenite::connect_async(ws_request(
            addr,
            &format!("http://{addr}"),
            Some(&auth),
        ))
        .await
        .expect("handshake");

        socket
            .send(tungstenite::Message::Text(
                r#"{"type":"resize","cols":100,"rows":40}"#.into(),
            ))
            .await
            .unwrap();
        socket
            .send(tungstenite::Message::Text("stty size; echo ws-$((6 * 7))\n".into()))
            .await
            .unwrap();

        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while !String::from_utf8_lossy(&seen).contains("ws-42") {
                match socket.next().await {
                    Some(Ok(tungstenite::Message::Binary(chunk))) => seen.extend(chunk),
                    Some(Ok(_)) => {}
                    other => panic!("socket ended: {other:?}"),
                }
            }
        })
        .await
        .expect("no terminal output");
        let out = String::from_utf8_lossy(&seen);
        assert!(out.contains("40 100"), "resize not applied: {out:?}");
        assert!(!out.contains("resize"));

        socket.close(None).await.unwrap();
    }

    #[tokio::test]
    async fn websocket_from_foreign_origin_is_refused() {
        let addr = spawn_gateway(config_with_auth(false)).await;
        match tokio_tungstenite::connect_async(ws_request(addr, "https://evil.example", None)).await {
            Err(tungstenite::Error::Http(res)) => assert_eq!(res.status().as_u16(), 403),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("handshake should fail"),
        }
    }

    #[tokio::test]
    async fn websocket_allowed_by_allow_list() {
        let config = GatewayConfig {
            allowed_origins: vec!["https://trusted.example".into()],
            ..config_with_auth(false)
        };
        let addr = spawn_gateway(config).await;
        let (mut socket, _) =
            tokio_tungstenite::connect_async(ws_request(addr, "https://trusted.example", None))
                .await
                .expect("handshake");
        socket.close(None).await.unwrap();
    }
}
