// Foreground server loop
// Binds a port, publishes it in the instance registry, serves the polling
// endpoints and raw files, and withdraws the record on shutdown.

use crate::instance::ports::{bind_listener, is_unavailable};
use crate::instance::{allocate_port, Config, Registry};
use crate::paths;
use crate::watch::resolve::{decode_request_path, resolve_within_root};
use crate::watch::{navigation, Navigation, Signature, SignatureEngine};
use anyhow::{anyhow, Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, HeaderName, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Attempts at allocate-then-bind before giving up on losing the race
const BIND_ATTEMPTS: usize = 3;

const NO_CACHE: [(HeaderName, &str); 3] = [
    (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
    (header::PRAGMA, "no-cache"),
    (header::EXPIRES, "0"),
];

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub root: PathBuf,
    pub port: u16,
    /// Enables the credits and logo routes
    pub header: bool,
    /// Running detached under the launcher
    pub child: bool,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<SignatureEngine>,
    config: Arc<Config>,
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientConfig {
    poll_interval_ms: u64,
    signature: String,
}

/// Allocate a port starting at `preferred`, bind it and record this process
/// as its owner.
///
/// The allocation probe releases the port before the real bind, so another
/// process can take it in between; that case goes back to allocation.
pub fn bind_instance(config: &Config, registry: &Registry, preferred: u16) -> Result<(TcpListener, u16)> {
    for _ in 0..BIND_ATTEMPTS {
        let port = allocate_port(preferred, &config.fallback_ports)
            .context("port allocation failed")?
            .ok_or_else(|| {
                anyhow!(
                    "no available port (tried {preferred} and fallbacks {:?})",
                    config.fallback_ports
                )
            })?;

        match bind_listener(port) {
            Ok(listener) => {
                registry.record(port, std::process::id()).log();
                return Ok((listener, port));
            }
            Err(e) if is_unavailable(&e) => {
                tracing::warn!(port, "port taken between probe and bind, retrying");
            }
            Err(e) => return Err(e).with_context(|| format!("failed to bind port {port}")),
        }
    }

    Err(anyhow!("could not bind a port after {BIND_ATTEMPTS} attempts"))
}

/// HTTP routes for a validated root
pub fn app(engine: SignatureEngine, config: Config, header: bool) -> Router {
    let state = AppState {
        engine: Arc::new(engine),
        config: Arc::new(config),
    };

    let mut router = Router::new()
        .route("/__sig__", get(signature_handler))
        .route("/__nav__", get(navigation_handler))
        .route("/__config__", get(config_handler));
    if header {
        router = router
            .route("/__credits__", get(credits_handler))
            .route("/__logo__", get(logo_handler));
    }
    router.fallback(raw_file_handler).with_state(state)
}

/// Run a server until Ctrl-C or SIGTERM
pub async fn serve(config: Config, options: ServeOptions) -> Result<()> {
    let root = paths::validate_root(&options.root)?;
    let engine = SignatureEngine::new(&root, config.signature_algorithm, config.listing.clone())
        .with_context(|| format!("failed to open {}", root.display()))?;
    let registry = Registry::new(&config);

    let (listener, port) = bind_instance(&config, &registry, options.port)?;
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    let pid = std::process::id();

    tracing::info!(
        port,
        pid,
        root = %root.display(),
        detached = options.child,
        "markdownup serving"
    );
    if !options.child {
        println!("Serving {} at http://localhost:{port}/", root.display());
        println!("Press Ctrl+C to stop");
    }

    let result = axum::serve(listener, app(engine, config, options.header))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    registry.remove_if_owned(port, pid).log();
    tracing::info!(port, "markdownup stopped");
    result.context("server error")
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown requested");
}

async fn signature_handler(State(state): State<AppState>, Query(query): Query<PathQuery>) -> Response {
    let engine = state.engine.clone();
    let signature = tokio::task::spawn_blocking(move || engine.signature(&query.path))
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("signature task failed: {e}");
            Signature::missing()
        });
    (NO_CACHE, Json(signature)).into_response()
}

async fn navigation_handler(State(state): State<AppState>, Query(query): Query<PathQuery>) -> Response {
    let engine = state.engine.clone();
    let nav = tokio::task::spawn_blocking(move || {
        navigation(engine.root(), engine.rules(), &query.path)
    })
    .await
    .unwrap_or_else(|e| {
        tracing::warn!("navigation task failed: {e}");
        Navigation::default()
    });
    (NO_CACHE, Json(nav)).into_response()
}

async fn config_handler(State(state): State<AppState>) -> Response {
    let body = ClientConfig {
        poll_interval_ms: u64::try_from(state.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
        signature: state.config.signature_algorithm.to_string(),
    };
    (NO_CACHE, Json(body)).into_response()
}

async fn credits_handler(State(state): State<AppState>) -> Response {
    send_file(&state.config.credits_file(), "credits.md").await
}

async fn logo_handler(State(state): State<AppState>) -> Response {
    send_file(&state.config.logo_file(), "images/logo.png").await
}

async fn raw_file_handler(State(state): State<AppState>, uri: Uri) -> Response {
    let relative = decode_request_path(uri.path());
    let root = state.engine.root().to_path_buf();
    let target = tokio::task::spawn_blocking(move || resolve_within_root(&root, &relative))
        .await
        .ok()
        .flatten();

    match target {
        Some(path) if path.is_file() => send_file(&path, &uri.path().to_string()).await,
        _ => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

async fn send_file(path: &Path, label: &str) -> Response {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let content_type = [(header::CONTENT_TYPE, content_type(path))];
            (NO_CACHE, content_type, bytes).into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, format!("{label} not found")).into_response()
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "read failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("error reading {label}")).into_response()
        }
    }
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" => "text/markdown; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
