//! Compute providers for the on-demand backend
//!
//! The lifecycle controller only needs three operations from whatever hosts
//! the backend: describe, start, and stop. [`DockerProvider`] drives an
//! existing container through the Docker API; [`StaticProvider`] stands for a
//! backend that is always up.

use crate::config::{OnDemandConfig, ProviderKind};
use crate::error::ProviderError;
use async_trait::async_trait;
use bollard::container::{StartContainerOptions, StopContainerOptions};
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum};
use bollard::Docker;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Lifecycle state of the backend's compute resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Unknown,
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Unknown => "unknown",
            InstanceState::Stopped => "stopped",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the provider reports about an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceDescription {
    pub state: InstanceState,
    /// Published address, if the instance has one
    pub address: Option<IpAddr>,
}

/// Starts, stops, and describes the on-demand backend
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    async fn describe_instance(&self, id: &str) -> Result<InstanceDescription, ProviderError>;

    async fn start_instance(&self, id: &str) -> Result<(), ProviderError>;

    async fn stop_instance(&self, id: &str) -> Result<(), ProviderError>;
}

/// Create the provider named by the `[on_demand]` section
pub async fn build_provider(config: &OnDemandConfig) -> anyhow::Result<Arc<dyn ComputeProvider>> {
    match config.provider {
        ProviderKind::Docker => {
            let provider = DockerProvider::new(config.docker_host.as_deref(), config.address).await?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Static => {
            let address = config
                .address
                .ok_or_else(|| anyhow::anyhow!("static provider requires an address"))?;
            Ok(Arc::new(StaticProvider::new(address)))
        }
    }
}

/// Seconds Docker waits for the backend to exit before killing it
const STOP_GRACE_SECS: i64 = 30;

/// Drives an existing Docker container
pub struct DockerProvider {
    client: Docker,
    address_override: Option<IpAddr>,
}

impl DockerProvider {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. bollard's platform default socket
    pub async fn new(docker_host: Option<&str>, address_override: Option<IpAddr>) -> anyhow::Result<Self> {
        let client = match docker_host.map(str::to_string).or_else(|| std::env::var("DOCKER_HOST").ok()) {
            Some(host) => Self::connect_to_host(&host)?,
            None => Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?,
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            address_override,
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    fn map_error(id: &str, err: bollard::errors::Error) -> ProviderError {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => ProviderError::NotFound(id.to_string()),
            bollard::errors::Error::DockerResponseServerError { message, .. } => {
                ProviderError::Rejected(message)
            }
            other => ProviderError::Unreachable(other.to_string()),
        }
    }
}

/// Map a container's inspect response onto instance state and address
fn describe_container(info: &ContainerInspectResponse) -> InstanceDescription {
    let status = info.state.as_ref().and_then(|s| s.status.as_ref());
    let state = match status {
        Some(ContainerStateStatusEnum::RUNNING) => InstanceState::Running,
        Some(ContainerStateStatusEnum::CREATED)
        | Some(ContainerStateStatusEnum::EXITED)
        | Some(ContainerStateStatusEnum::DEAD) => InstanceState::Stopped,
        Some(ContainerStateStatusEnum::RESTARTING) => InstanceState::Starting,
        Some(ContainerStateStatusEnum::REMOVING) => InstanceState::Stopping,
        _ => InstanceState::Unknown,
    };

    let settings = info.network_settings.as_ref();
    let primary = settings.and_then(|n| n.ip_address.clone());
    let from_networks = || {
        settings
            .and_then(|n| n.networks.as_ref())
            .and_then(|nets| nets.values().find_map(|e| e.ip_address.clone().filter(|ip| !ip.is_empty())))
    };
    let address = primary
        .filter(|ip| !ip.is_empty())
        .or_else(from_networks)
        .and_then(|ip| ip.parse().ok());

    InstanceDescription { state, address }
}

#[async_trait]
impl ComputeProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn describe_instance(&self, id: &str) -> Result<InstanceDescription, ProviderError> {
        let info = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|e| Self::map_error(id, e))?;

        let mut description = describe_container(&info);
        if let Some(address) = self.address_override {
            description.address = Some(address);
        }
        Ok(description)
    }

    async fn start_instance(&self, id: &str) -> Result<(), ProviderError> {
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                info!(container = id, "Started Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container = id, "Container was already running");
                Ok(())
            }
            Err(e) => Err(Self::map_error(id, e)),
        }
    }

    async fn stop_instance(&self, id: &str) -> Result<(), ProviderError> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                info!(container = id, "Stopped Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container = id, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(Self::map_error(id, e)),
        }
    }
}

/// A backend that is always running at a fixed address
pub struct StaticProvider {
    address: IpAddr,
}

impl StaticProvider {
    pub fn new(address: IpAddr) -> Self {
        Self { address }
    }
}

#[async_trait]
impl ComputeProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn describe_instance(&self, _id: &str) -> Result<InstanceDescription, ProviderError> {
        Ok(InstanceDescription {
            state: InstanceState::Running,
            address: Some(self.address),
        })
    }

    async fn start_instance(&self, _id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn stop_instance(&self, id: &str) -> Result<(), ProviderError> {
        debug!(instance = id, "Static backend cannot be stopped; ignoring");
        Ok(())
    }
}


#[cfg(test)]
pub(crate) mod testing {
    //! In-memory provider for controller and scheduler tests

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    pub struct FakeProvider {
        current: Mutex<InstanceDescription>,
        address: IpAddr,
        starts: AtomicU32,
        stops: AtomicU32,
        describes: AtomicU32,
        failing_describes: AtomicU32,
        failing_stop: AtomicBool,
        stop_delay: Mutex<Duration>,
    }

    impl FakeProvider {
        fn with_state(state: InstanceState, address: IpAddr) -> Arc<Self> {
            let published = (state == InstanceState::Running).then_some(address);
            Arc::new(Self {
                current: Mutex::new(InstanceDescription {
                    state,
                    address: published,
                }),
                address,
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                describes: AtomicU32::new(0),
                failing_describes: AtomicU32::new(0),
                failing_stop: AtomicBool::new(false),
                stop_delay: Mutex::new(Duration::ZERO),
            })
        }

        pub fn stopped() -> Arc<Self> {
            Self::with_state(InstanceState::Stopped, IpAddr::from([127, 0, 0, 1]))
        }

        pub fn running() -> Arc<Self> {
            Self::with_state(InstanceState::Running, IpAddr::from([127, 0, 0, 1]))
        }

        pub fn set(&self, state: InstanceState, address: Option<IpAddr>) {
            *self.current.lock() = InstanceDescription { state, address };
        }

        pub fn fail_next_describes(&self, n: u32) {
            self.failing_describes.store(n, Ordering::SeqCst);
        }

        pub fn fail_next_stop(&self) {
            self.failing_stop.store(true, Ordering::SeqCst);
        }

        /// Make stop commands take `delay` before the instance stops
        pub fn slow_stop(&self, delay: Duration) {
            *self.stop_delay.lock() = delay;
        }

        pub fn starts(&self) -> u32 {
            self.starts.load(Ordering::SeqCst)
        }

        pub fn stops(&self) -> u32 {
            self.stops.load(Ordering::SeqCst)
        }

        pub fn describes(&self) -> u32 {
            self.describes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ComputeProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn describe_instance(&self, _id: &str) -> Result<InstanceDescription, ProviderError> {
            self.describes.fetch_add(1, Ordering::SeqCst);
            let failing = self.failing_describes.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_describes.store(failing - 1, Ordering::SeqCst);
                return Err(ProviderError::Unreachable("injected failure".to_string()));
            }
            Ok(*self.current.lock())
        }

        async fn start_instance(&self, _id: &str) -> Result<(), ProviderError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.set(InstanceState::Running, Some(self.address));
            Ok(())
        }

        async fn stop_instance(&self, _id: &str) -> Result<(), ProviderError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            let delay = *self.stop_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.failing_stop.swap(false, Ordering::SeqCst) {
                return Err(ProviderError::Rejected("injected stop failure".to_string()));
            }
            self.set(InstanceState::Stopped, None);
            Ok(())
        }
    }
}
