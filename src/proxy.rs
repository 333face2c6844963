//! The client-facing listener
//!
//! Each connection is handled on its own task: decode the handshake, resolve
//! the route, apply admission, then forward to the backend or to the friendly
//! responder. No per-connection failure reaches the accept loop.

use crate::admission::Admission;
use crate::error::DenialCode;
use crate::forward::Forwarder;
use crate::friendly::FriendlyResponder;
use crate::handshake::{read_handshake, read_login_start, with_deadline, Handshake, HandshakeDecoder};
use crate::lifecycle::{LifecycleController, Readiness};
use crate::routes::{Route, RouteTarget, SharedRoutes};
use crate::session::{SessionInfo, SessionKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Everything a connection handler needs
pub struct ProxyContext {
    pub routes: Arc<SharedRoutes>,
    pub admission: Arc<Admission>,
    /// Absent when no on-demand backend is configured
    pub lifecycle: Option<Arc<LifecycleController>>,
    pub forwarder: Forwarder,
    pub friendly: Arc<FriendlyResponder>,
    pub handshake_timeout: Option<Duration>,
}

/// The client-facing TCP listener
pub struct ProxyServer {
    listener: TcpListener,
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        context: Arc<ProxyContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind proxy listener on {}: {}", bind_addr, e))?;
        Ok(Self {
            listener,
            context,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "Proxy server listening");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, addr, context).await {
                                    debug!(client = %addr, error = %e, "Connection closed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Format a host and port as a connect target
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// One client connection after its handshake has been read
struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: HandshakeDecoder,
    handshake: Handshake,
    host: String,
}

impl Client {
    fn session(&self, backend: String, kind: SessionKind) -> SessionInfo {
        SessionInfo {
            client: self.peer,
            backend,
            host: self.host.clone(),
            kind,
            started: Instant::now(),
        }
    }
}

async fn handle_client(mut stream: TcpStream, peer: SocketAddr, ctx: Arc<ProxyContext>) -> anyhow::Result<()> {
    let mut decoder = HandshakeDecoder::new();
    let handshake = with_deadline(ctx.handshake_timeout, read_handshake(&mut stream, &mut decoder)).await?;
    let host = handshake.normalized_host();

    debug!(
        client = %peer,
        host = %host,
        protocol = handshake.protocol_version,
        next_state = handshake.next_state,
        "Handshake received"
    );

    let client = Client {
        stream,
        peer,
        decoder,
        handshake,
        host,
    };

    // Decided here: a reload after this point does not affect this connection
    let Some(route) = ctx.routes.resolve(&client.host) else {
        debug!(client = %peer, host = %client.host, "No route for host");
        return deny(&ctx, client, DenialCode::NoRoute).await;
    };

    if route.admission && ctx.admission.is_banned(peer.ip()) {
        debug!(client = %peer, host = %client.host, "Banned address, closing");
        return Ok(());
    }

    match &route.target {
        RouteTarget::Local { host, port } => {
            let target = join_host_port(host, *port);
            forward_local(&ctx, client, &route, target).await
        }
        RouteTarget::OnDemand => match &ctx.lifecycle {
            Some(lifecycle) => forward_on_demand(&ctx, client, &route, lifecycle).await,
            None => deny(&ctx, client, DenialCode::Unavailable).await,
        },
    }
}

async fn forward_local(ctx: &ProxyContext, client: Client, route: &Route, target: String) -> anyhow::Result<()> {
    if route.admission && client.handshake.is_login() {
        if let Err(code) = ctx.admission.admit_login(client.peer.ip(), None, false) {
            return deny(ctx, client, code).await;
        }
    }

    match ctx.forwarder.connect(&target).await {
        Ok(backend) => {
            let info = client.session(target, SessionKind::Local);
            ctx.forwarder
                .splice(client.stream, backend, client.decoder.buffered(), info)
                .await?;
            Ok(())
        }
        Err(e) => {
            warn!(client = %client.peer, host = %client.host, error = %e, "Local backend unreachable");
            deny(ctx, client, DenialCode::Unavailable).await
        }
    }
}

async fn forward_on_demand(
    ctx: &ProxyContext,
    mut client: Client,
    route: &Route,
    lifecycle: &Arc<LifecycleController>,
) -> anyhow::Result<()> {
    let ip = client.peer.ip();

    if let Some(addr) = lifecycle.ready_address() {
        if route.admission && client.handshake.is_login() {
            if let Err(code) = ctx.admission.admit_login(ip, None, false) {
                return deny(ctx, client, code).await;
            }
        }

        let target = addr.to_string();
        return match ctx.forwarder.connect(&target).await {
            Ok(backend) => {
                let info = client.session(target, SessionKind::OnDemand);
                ctx.forwarder
                    .splice(client.stream, backend, client.decoder.buffered(), info)
                    .await?;
                Ok(())
            }
            Err(e) => {
                warn!(client = %client.peer, error = %e, "On-demand backend unreachable");
                lifecycle.mark_unreachable();
                deny(ctx, client, DenialCode::Unavailable).await
            }
        };
    }

    if !client.handshake.is_login() {
        let code = if lifecycle.is_starting() {
            DenialCode::Starting
        } else {
            DenialCode::Sleeping
        };
        return deny(ctx, client, code).await;
    }

    let login = with_deadline(
        ctx.handshake_timeout,
        read_login_start(&mut client.stream, &mut client.decoder),
    )
    .await?;

    if route.admission {
        if let Err(code) = ctx.admission.admit_login(ip, Some(&login.name), true) {
            return deny(ctx, client, code).await;
        }
    }

    info!(client = %client.peer, player = %login.name, host = %client.host, "Login requested backend start");
    let lifecycle = Arc::clone(lifecycle);
    tokio::spawn(async move {
        match lifecycle.ensure_running().await {
            Ok(Readiness::Ready(addr)) => debug!(%addr, "Backend ready after login request"),
            Ok(Readiness::Debounced) => debug!("Start request debounced"),
            Err(e) => warn!(error = %e, "Backend did not become ready"),
        }
    });

    deny(ctx, client, DenialCode::Starting).await
}

/// Send the client to the friendly responder for `code`
async fn deny(ctx: &ProxyContext, client: Client, code: DenialCode) -> anyhow::Result<()> {
    let Some(target) = ctx.friendly.target(code) else {
        return Ok(());
    };

    if code.is_failure() {
        info!(client = %client.peer, host = %client.host, code = %code, "Connection denied");
    } else {
        debug!(client = %client.peer, host = %client.host, code = %code, "Sending to friendly responder");
    }

    let target = target.to_string();
    let info = client.session(target.clone(), SessionKind::Friendly);
    ctx.forwarder
        .forward(client.stream, &target, client.decoder.buffered(), info)
        .await?;
    Ok(())
}
