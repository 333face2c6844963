//! Lifecycle controller for the on-demand backend
//!
//! One readiness sequence runs at a time: concurrent [`LifecycleController::ensure_running`]
//! calls share it through a `watch` channel and all observe the same outcome.
//! The sequence is a spawned task, so a caller that gives up waiting does not
//! cancel it for anyone else.

use crate::config::OnDemandConfig;
use crate::error::LifecycleError;
use crate::provider::{ComputeProvider, InstanceDescription, InstanceState};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timing and identity for the controlled backend
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub instance_id: String,
    pub service_port: u16,
    pub poll_interval: Duration,
    pub start_timeout: Duration,
    pub probe_timeout: Duration,
    pub start_debounce: Duration,
}

impl From<&OnDemandConfig> for LifecycleSettings {
    fn from(config: &OnDemandConfig) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            service_port: config.service_port,
            poll_interval: config.poll_interval(),
            start_timeout: config.start_timeout(),
            probe_timeout: config.probe_timeout(),
            start_debounce: config.start_debounce(),
        }
    }
}

/// Result of [`LifecycleController::ensure_running`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The backend accepted a TCP connection at this address
    Ready(SocketAddr),
    /// A start command was issued recently; nothing was done
    Debounced,
}

type Outcome = Option<Result<SocketAddr, LifecycleError>>;

struct ControllerState {
    state: InstanceState,
    address: Option<IpAddr>,
    ready: Option<SocketAddr>,
    last_observed: Option<Instant>,
    last_start: Option<Instant>,
    in_flight: Option<watch::Receiver<Outcome>>,
}

/// Snapshot for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub instance_id: String,
    pub provider: &'static str,
    pub state: InstanceState,
    pub ready_address: Option<String>,
    pub starting: bool,
    pub last_observed_secs_ago: Option<u64>,
    pub start_commands: u64,
    pub stop_commands: u64,
    pub readiness_sequences: u64,
}

pub struct LifecycleController {
    provider: Arc<dyn ComputeProvider>,
    settings: LifecycleSettings,
    inner: Mutex<ControllerState>,
    start_commands: AtomicU64,
    stop_commands: AtomicU64,
    sequences: AtomicU64,
}

impl LifecycleController {
    pub fn new(provider: Arc<dyn ComputeProvider>, settings: LifecycleSettings) -> Arc<Self> {
        Arc::new(Self {
            provider,
            settings,
            inner: Mutex::new(ControllerState {
                state: InstanceState::Unknown,
                address: None,
                ready: None,
                last_observed: None,
                last_start: None,
                in_flight: None,
            }),
            start_commands: AtomicU64::new(0),
            stop_commands: AtomicU64::new(0),
            sequences: AtomicU64::new(0),
        })
    }

    /// Address of the backend if it is known to accept connections
    pub fn ready_address(&self) -> Option<SocketAddr> {
        self.inner.lock().ready
    }

    /// Whether a readiness sequence is in flight
    pub fn is_starting(&self) -> bool {
        self.inner.lock().in_flight.is_some()
    }

    pub fn state(&self) -> InstanceState {
        self.inner.lock().state
    }

    /// Make sure the backend is running and reachable.
    ///
    /// Joins the in-flight sequence if there is one. Returns
    /// [`Readiness::Debounced`] without doing anything if a start command went
    /// out within the debounce window.
    pub async fn ensure_running(self: &Arc<Self>) -> Result<Readiness, LifecycleError> {
        let mut rx = {
            let mut inner = self.inner.lock();
            if let Some(addr) = inner.ready {
                return Ok(Readiness::Ready(addr));
            }

            match &inner.in_flight {
                Some(rx) => rx.clone(),
                None => {
                    let debounced = inner
                        .last_start
                        .is_some_and(|at| at.elapsed() < self.settings.start_debounce);
                    if debounced {
                        debug!(instance = %self.settings.instance_id, "Start requested within debounce window");
                        return Ok(Readiness::Debounced);
                    }

                    let (tx, rx) = watch::channel(None);
                    inner.in_flight = Some(rx.clone());

                    let controller = Arc::clone(self);
                    tokio::spawn(async move {
                        let outcome = controller.run_sequence().await;
                        controller.finish(&outcome);
                        let _ = tx.send(Some(outcome));
                    });
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| LifecycleError::Aborted)?
            .clone();

        match outcome {
            Some(Ok(addr)) => Ok(Readiness::Ready(addr)),
            Some(Err(e)) => Err(e),
            None => Err(LifecycleError::Aborted),
        }
    }

    async fn run_sequence(&self) -> Result<SocketAddr, LifecycleError> {
        self.sequences.fetch_add(1, Ordering::Relaxed);
        info!(
            instance = %self.settings.instance_id,
            provider = self.provider.name(),
            "Starting backend readiness sequence"
        );

        let limit = self.settings.start_timeout;
        match tokio::time::timeout(limit, self.poll_until_ready()).await {
            Ok(addr) => Ok(addr),
            Err(_) => Err(LifecycleError::Timeout(limit)),
        }
    }

    /// Poll the provider until the backend accepts a TCP connection.
    /// Provider errors are retried on the next tick.
    async fn poll_until_ready(&self) -> SocketAddr {
        let id = self.settings.instance_id.as_str();
        let mut started = false;
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let desc = match self.provider.describe_instance(id).await {
                Ok(desc) => desc,
                Err(e) => {
                    warn!(instance = id, error = %e, "Failed to describe backend, retrying");
                    continue;
                }
            };
            self.observe(desc);

            match desc.state {
                InstanceState::Running => {
                    let Some(ip) = desc.address else {
                        debug!(instance = id, "Backend running without an address yet");
                        continue;
                    };
                    let addr = SocketAddr::new(ip, self.settings.service_port);
                    if self.probe(addr).await {
                        return addr;
                    }
                    debug!(instance = id, %addr, "Backend not accepting connections yet");
                }
                InstanceState::Stopped | InstanceState::Unknown if !started => {
                    self.start_commands.fetch_add(1, Ordering::Relaxed);
                    self.inner.lock().last_start = Some(Instant::now());
                    match self.provider.start_instance(id).await {
                        Ok(()) => {
                            started = true;
                            self.inner.lock().state = InstanceState::Starting;
                            info!(instance = id, "Start command issued");
                        }
                        Err(e) => warn!(instance = id, error = %e, "Start command failed, retrying"),
                    }
                }
                state => debug!(instance = id, %state, "Waiting for backend"),
            }
        }
    }

    /// Bounded raw TCP connect to the backend's service port
    async fn probe(&self, addr: SocketAddr) -> bool {
        matches!(
            tokio::time::timeout(self.settings.probe_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    fn observe(&self, desc: InstanceDescription) {
        let mut inner = self.inner.lock();
        inner.state = desc.state;
        inner.address = desc.address;
        inner.last_observed = Some(Instant::now());
        if desc.state != InstanceState::Running {
            inner.ready = None;
        }
    }

    fn finish(&self, outcome: &Result<SocketAddr, LifecycleError>) {
        let mut inner = self.inner.lock();
        inner.in_flight = None;
        match outcome {
            Ok(addr) => {
                inner.ready = Some(*addr);
                inner.state = InstanceState::Running;
                info!(instance = %self.settings.instance_id, %addr, "Backend ready");
            }
            Err(e) => {
                warn!(
                    instance = %self.settings.instance_id,
                    state = %inner.state,
                    error = %e,
                    "Backend readiness sequence failed"
                );
            }
        }
    }

    /// Stop the backend if the provider reports it running.
    ///
    /// Returns whether a stop command was issued. Never interrupts a
    /// readiness sequence.
    pub async fn stop(&self) -> Result<bool, LifecycleError> {
        if self.is_starting() {
            debug!(instance = %self.settings.instance_id, "Readiness sequence in flight, not stopping");
            return Ok(false);
        }

        let id = self.settings.instance_id.as_str();
        let desc = self.provider.describe_instance(id).await?;
        self.observe(desc);
        if desc.state != InstanceState::Running {
            debug!(instance = id, state = %desc.state, "Backend not running, nothing to stop");
            return Ok(false);
        }

        // Readiness is dropped before the command and restored if it fails
        let previous = {
            let mut inner = self.inner.lock();
            inner.state = InstanceState::Stopping;
            inner.address = None;
            inner.ready.take()
        };

        self.stop_commands.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.provider.stop_instance(id).await {
            let mut inner = self.inner.lock();
            if inner.in_flight.is_none() && inner.ready.is_none() {
                inner.state = desc.state;
                inner.address = desc.address;
                inner.ready = previous;
            }
            return Err(e.into());
        }

        info!(instance = id, "Stop command issued");
        Ok(true)
    }

    /// Compare our view with the provider's and pick up changes made
    /// outside this process.
    pub async fn reconcile(&self) -> Result<InstanceState, LifecycleError> {
        if self.is_starting() {
            return Ok(self.state());
        }

        let id = self.settings.instance_id.as_str();
        let was_ready = self.ready_address();
        let desc = self.provider.describe_instance(id).await?;
        self.observe(desc);

        match (desc.state, desc.address) {
            (InstanceState::Running, Some(ip)) => {
                let addr = SocketAddr::new(ip, self.settings.service_port);
                if was_ready != Some(addr) && self.probe(addr).await {
                    let mut inner = self.inner.lock();
                    if inner.in_flight.is_none() {
                        inner.ready = Some(addr);
                        info!(instance = id, %addr, "Backend found running, serving directly");
                    }
                }
            }
            (state, _) if was_ready.is_some() && state != InstanceState::Running => {
                info!(instance = id, %state, "Backend stopped outside the proxy");
            }
            _ => {}
        }

        Ok(desc.state)
    }

    /// Forget readiness after a failed connection to the backend
    pub fn mark_unreachable(&self) {
        let mut inner = self.inner.lock();
        if inner.ready.take().is_some() {
            warn!(instance = %self.settings.instance_id, "Backend unreachable, clearing readiness");
        }
    }

    pub fn status(&self) -> LifecycleStatus {
        let inner = self.inner.lock();
        LifecycleStatus {
            instance_id: self.settings.instance_id.clone(),
            provider: self.provider.name(),
            state: inner.state,
            ready_address: inner.ready.map(|a| a.to_string()),
            starting: inner.in_flight.is_some(),
            last_observed_secs_ago: inner.last_observed.map(|at| at.elapsed().as_secs()),
            start_commands: self.start_commands.load(Ordering::Relaxed),
            stop_commands: self.stop_commands.load(Ordering::Relaxed),
            readiness_sequences: self.sequences.load(Ordering::Relaxed),
        }
    }
}
