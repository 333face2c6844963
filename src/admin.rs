use crate::admission::Admission;
use crate::lifecycle::{LifecycleController, Readiness};
use crate::routes::SharedRoutes;
use crate::session::SessionRegistry;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// State the admin API reads and acts on
pub struct AdminState {
    pub admission: Arc<Admission>,
    pub lifecycle: Option<Arc<LifecycleController>>,
    pub sessions: Arc<SessionRegistry>,
    pub routes: Arc<SharedRoutes>,
    /// Config file re-read by `POST /routes/reload`
    pub config_path: Option<PathBuf>,
    pub started: Instant,
}

/// Admin API server for status, allow-list management, and backend control
pub struct AdminServer {
    listener: TcpListener,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        state: Arc<AdminState>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind admin API on {}: {}", bind_addr, e))?;
        Ok(Self {
            listener,
            state,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    state: Arc<AdminState>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, state, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

fn no_backend() -> Response<Full<Bytes>> {
    response(StatusCode::NOT_FOUND, "no on-demand backend configured")
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AdminState>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    // Health and version need no auth
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    if !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/status") => {
            let backend = state.lifecycle.as_ref().map(|l| l.status());
            let body = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
                "uptime_secs": state.started.elapsed().as_secs(),
                "routes": state.routes.snapshot().len(),
                "sessions": {
                    "total": state.sessions.len(),
                    "on_demand": state.sessions.on_demand_active(),
                    "list": state.sessions.list(),
                },
                "backend": backend,
                "admission": state.admission.stats(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::GET, "/allowlist") => {
            let names = state.admission.allowlist().names();
            let body = serde_json::json!({ "count": names.len(), "names": names });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::POST, path) if path.starts_with("/allowlist/") => {
            let name = path.strip_prefix("/allowlist/").unwrap_or("");
            match state.admission.allowlist().insert(name) {
                Ok(true) => {
                    info!(name, "Added to allow-list");
                    response(StatusCode::CREATED, "added")
                }
                Ok(false) => response(StatusCode::OK, "already present"),
                Err(e) if name.trim().is_empty() => response(StatusCode::BAD_REQUEST, e.to_string()),
                Err(e) => {
                    error!(error = %e, "Failed to update allow-list");
                    response(StatusCode::INTERNAL_SERVER_ERROR, "failed to save allow-list")
                }
            }
        }

        (&Method::DELETE, path) if path.starts_with("/allowlist/") => {
            let name = path.strip_prefix("/allowlist/").unwrap_or("");
            match state.admission.allowlist().remove(name) {
                Ok(true) => {
                    info!(name, "Removed from allow-list");
                    response(StatusCode::OK, "removed")
                }
                Ok(false) => response(StatusCode::NOT_FOUND, "not present"),
                Err(e) => {
                    error!(error = %e, "Failed to update allow-list");
                    response(StatusCode::INTERNAL_SERVER_ERROR, "failed to save allow-list")
                }
            }
        }

        (&Method::POST, "/backend/start") => match &state.lifecycle {
            Some(lifecycle) => match lifecycle.ready_address() {
                Some(addr) => {
                    let body = serde_json::json!({ "status": "ready", "address": addr.to_string() });
                    json_response(StatusCode::OK, body.to_string())
                }
                None => {
                    let lifecycle = Arc::clone(lifecycle);
                    tokio::spawn(async move {
                        match lifecycle.ensure_running().await {
                            Ok(Readiness::Ready(addr)) => info!(%addr, "Backend started via admin API"),
                            Ok(Readiness::Debounced) => debug!("Admin start request debounced"),
                            Err(e) => warn!(error = %e, "Admin-requested start failed"),
                        }
                    });
                    let body = serde_json::json!({ "status": "starting" });
                    json_response(StatusCode::ACCEPTED, body.to_string())
                }
            },
            None => no_backend(),
        },

        (&Method::POST, "/backend/stop") => match &state.lifecycle {
            Some(lifecycle) => match lifecycle.stop().await {
                Ok(stopped) => {
                    let body = serde_json::json!({ "stopped": stopped });
                    json_response(StatusCode::OK, body.to_string())
                }
                Err(e) => {
                    warn!(error = %e, "Admin-requested stop failed");
                    response(StatusCode::BAD_GATEWAY, e.to_string())
                }
            },
            None => no_backend(),
        },

        (&Method::POST, "/routes/reload") => match &state.config_path {
            Some(config_path) => match state.routes.reload_from(config_path) {
                Ok(count) => {
                    let body = serde_json::json!({ "routes": count });
                    json_response(StatusCode::OK, body.to_string())
                }
                Err(e) => {
                    warn!(error = %e, "Route reload failed");
                    response(StatusCode::BAD_REQUEST, e.to_string())
                }
            },
            None => response(StatusCode::NOT_FOUND, "no config file to reload"),
        },

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
