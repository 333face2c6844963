use idlegate::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use idlegate::admission::Admission;
use idlegate::config::Config;
use idlegate::forward::Forwarder;
use idlegate::friendly::FriendlyResponder;
use idlegate::idle::IdleScheduler;
use idlegate::lifecycle::{LifecycleController, LifecycleSettings};
use idlegate::provider::build_provider;
use idlegate::proxy::{ProxyContext, ProxyServer};
use idlegate::routes::{RouteTable, SharedRoutes};
use idlegate::session::SessionRegistry;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("idlegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let started = Instant::now();

    // Admission control
    let admission = Arc::new(Admission::from_config(&config.admission)?);

    // On-demand backend
    let lifecycle = match &config.on_demand {
        Some(on_demand) => {
            let provider = build_provider(on_demand).await?;
            let lifecycle = LifecycleController::new(provider, LifecycleSettings::from(on_demand));
            match lifecycle.reconcile().await {
                Ok(state) => info!(instance = %on_demand.instance_id, state = %state, "Initial backend state"),
                Err(e) => warn!(instance = %on_demand.instance_id, error = %e, "Could not read initial backend state"),
            }
            Some(lifecycle)
        }
        None => None,
    };

    let routes = SharedRoutes::new(RouteTable::from_config(&config.routes));
    let sessions = SessionRegistry::new();
    let forwarder = Forwarder::new(Arc::clone(&sessions), config.server.connect_timeout());
    let friendly = Arc::new(FriendlyResponder::bind(&config.friendly, shutdown_rx.clone()).await?);

    // Client-facing listener
    let proxy_addr = parse_addr(&config.server.bind, config.server.port, "proxy")?;
    let context = Arc::new(ProxyContext {
        routes: Arc::clone(&routes),
        admission: Arc::clone(&admission),
        lifecycle: lifecycle.clone(),
        forwarder,
        friendly,
        handshake_timeout: config.server.handshake_timeout(),
    });
    let proxy = ProxyServer::bind(proxy_addr, context, shutdown_rx.clone()).await?;
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Idle shutdown and periodic maintenance
    if let (Some(lifecycle), Some(on_demand)) = (&lifecycle, &config.on_demand) {
        let scheduler = IdleScheduler::new(
            Arc::clone(lifecycle),
            sessions.subscribe(),
            on_demand.idle_shutdown(),
            on_demand.idle_tick(),
        );
        tokio::spawn(scheduler.run(shutdown_rx.clone()));
    }

    let reconcile_interval = config
        .on_demand
        .as_ref()
        .map(|o| o.reconcile_interval())
        .unwrap_or(Duration::from_secs(60));
    tokio::spawn(maintenance_loop(
        lifecycle.clone(),
        Arc::clone(&admission),
        reconcile_interval,
        shutdown_rx.clone(),
    ));

    // Admin API (always bound to loopback, port 0 disables it)
    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr = SocketAddr::from(([127, 0, 0, 1], config.server.admin_port));

        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let admin_state = Arc::new(AdminState {
            admission: Arc::clone(&admission),
            lifecycle: lifecycle.clone(),
            sessions: Arc::clone(&sessions),
            routes: Arc::clone(&routes),
            config_path: Some(config_path.clone()),
            started,
        });
        let admin_server = AdminServer::bind(admin_addr, admin_state, shutdown_rx.clone(), admin_token).await?;
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        info!("Admin API disabled");
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or route reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading routes...");
                    if let Err(e) = routes.reload_from(&config_path) {
                        error!(error = %e, "Failed to reload routes, keeping current table");
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown; the on-demand backend is left as it is
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    if !sessions.is_empty() {
        info!(sessions = sessions.len(), "Exiting with sessions still open");
    }

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn parse_addr(bind: &str, port: u16, what: &str) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind = %bind, port, error = %e, "Invalid {} bind address", what);
        anyhow::anyhow!("Invalid {} bind address: {}", what, e)
    })
}

/// Refresh the cached backend state and sweep stale admission records
async fn maintenance_loop(
    lifecycle: Option<Arc<LifecycleController>>,
    admission: Arc<Admission>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Some(ref lifecycle) = lifecycle {
                    if let Err(e) = lifecycle.reconcile().await {
                        debug!(error = %e, "Backend reconcile failed");
                    }
                }
                admission.sweep();
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Non-blocking exclusive lock, held for the life of the process
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        handshake_timeout_secs = config.server.handshake_timeout_secs,
        connect_timeout_ms = config.server.connect_timeout_ms,
        "Server configuration"
    );
    info!(
        route_count = config.routes.len(),
        routes = ?config.routes.keys().collect::<Vec<_>>(),
        "Configured routes"
    );
    match &config.on_demand {
        Some(on_demand) => info!(
            provider = ?on_demand.provider,
            instance = %on_demand.instance_id,
            service_port = on_demand.service_port,
            start_timeout_secs = on_demand.start_timeout_secs,
            idle_shutdown_secs = on_demand.idle_shutdown_secs,
            "On-demand backend"
        ),
        None => info!("No on-demand backend configured"),
    }
    info!(
        max_tokens = config.admission.rate_limit.max_tokens,
        max_failures = config.admission.ban.max_failures,
        ban_duration_secs = config.admission.ban.ban_duration_secs,
        allowlist = config.admission.allowlist_enabled,
        "Admission settings"
    );
}
