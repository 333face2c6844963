//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use idlegate::admission::{Admission, AllowList};
use idlegate::config::{AdmissionConfig, FriendlyConfig, RouteConfig};
use idlegate::error::{DenialCode, ProviderError};
use idlegate::forward::Forwarder;
use idlegate::friendly::FriendlyResponder;
use idlegate::handshake::{encode_handshake, encode_login_start, read_packet, write_packet, HandshakeDecoder, Packet};
use idlegate::lifecycle::{LifecycleController, LifecycleSettings};
use idlegate::provider::{ComputeProvider, InstanceDescription, InstanceState};
use idlegate::proxy::{ProxyContext, ProxyServer};
use idlegate::routes::{RouteTable, SharedRoutes};
use idlegate::session::SessionRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

pub const PROTOCOL: i32 = 765;

/// Provider whose instance becomes running as soon as it is started
pub struct TestProvider {
    state: Mutex<InstanceState>,
    starts: AtomicU32,
    stops: AtomicU32,
}

impl TestProvider {
    pub fn new(state: InstanceState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
        })
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeProvider for TestProvider {
    fn name(&self) -> &'static str {
        "test"
    }

    async fn describe_instance(&self, _id: &str) -> Result<InstanceDescription, ProviderError> {
        let state = *self.state.lock();
        let address = (state == InstanceState::Running).then(|| IpAddr::from([127, 0, 0, 1]));
        Ok(InstanceDescription { state, address })
    }

    async fn start_instance(&self, _id: &str) -> Result<(), ProviderError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = InstanceState::Running;
        Ok(())
    }

    async fn stop_instance(&self, _id: &str) -> Result<(), ProviderError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = InstanceState::Stopped;
        Ok(())
    }
}

/// A running proxy with every component bound to loopback
pub struct Gate {
    pub addr: SocketAddr,
    pub routes: Arc<SharedRoutes>,
    pub admission: Arc<Admission>,
    pub lifecycle: Option<Arc<LifecycleController>>,
    pub sessions: Arc<SessionRegistry>,
    pub shutdown: watch::Sender<bool>,
}

pub struct GateBuilder {
    routes: HashMap<String, RouteConfig>,
    admission: AdmissionConfig,
    allowlist: Vec<String>,
    on_demand: Option<(Arc<dyn ComputeProvider>, u16)>,
}

impl GateBuilder {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            admission: AdmissionConfig::default(),
            allowlist: Vec::new(),
            on_demand: None,
        }
    }

    pub fn route(mut self, pattern: &str, route: RouteConfig) -> Self {
        self.routes.insert(pattern.to_string(), route);
        self
    }

    pub fn admission(mut self, config: AdmissionConfig) -> Self {
        self.admission = config;
        self
    }

    pub fn allow(mut self, name: &str) -> Self {
        self.admission.allowlist_enabled = true;
        self.allowlist.push(name.to_string());
        self
    }

    /// On-demand backend reachable on loopback at `service_port` once running
    pub fn on_demand(mut self, provider: Arc<dyn ComputeProvider>, service_port: u16) -> Self {
        self.on_demand = Some((provider, service_port));
        self
    }

    pub async fn start(self) -> Gate {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let allowlist = Arc::new(AllowList::in_memory(&self.allowlist));
        let admission = Arc::new(Admission::new(&self.admission, allowlist));
        let lifecycle = self.on_demand.map(|(provider, service_port)| {
            LifecycleController::new(
                provider,
                LifecycleSettings {
                    instance_id: "mc-test".to_string(),
                    service_port,
                    poll_interval: Duration::from_millis(10),
                    start_timeout: Duration::from_secs(5),
                    probe_timeout: Duration::from_millis(500),
                    start_debounce: Duration::from_secs(30),
                },
            )
        });

        let routes = SharedRoutes::new(RouteTable::from_config(&self.routes));
        let sessions = SessionRegistry::new();
        let friendly = FriendlyResponder::bind(&FriendlyConfig::default(), shutdown_rx.clone())
            .await
            .unwrap();

        let context = Arc::new(ProxyContext {
            routes: Arc::clone(&routes),
            admission: Arc::clone(&admission),
            lifecycle: lifecycle.clone(),
            forwarder: Forwarder::new(Arc::clone(&sessions), Duration::from_secs(1)),
            friendly: Arc::new(friendly),
            handshake_timeout: Some(Duration::from_secs(2)),
        });

        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), context, shutdown_rx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        Gate {
            addr,
            routes,
            admission,
            lifecycle,
            sessions,
            shutdown,
        }
    }
}

/// Connect and send a login handshake plus Login Start for `name`
pub async fn login(gate: &Gate, host: &str, name: &str) -> TcpStream {
    let mut stream = TcpStream::connect(gate.addr).await.unwrap();
    let mut bytes = encode_handshake(PROTOCOL, host, 25565, 2);
    bytes.extend_from_slice(&encode_login_start(name));
    stream.write_all(&bytes).await.unwrap();
    stream
}

/// Connect and send a status handshake plus Status Request
pub async fn status(gate: &Gate, host: &str) -> TcpStream {
    let mut stream = TcpStream::connect(gate.addr).await.unwrap();
    let mut bytes = encode_handshake(PROTOCOL, host, 25565, 1);
    write_packet(&mut bytes, 0x00, &[]);
    stream.write_all(&bytes).await.unwrap();
    stream
}

/// Read one packet with a deadline
pub async fn next_packet(stream: &mut TcpStream) -> Packet {
    let mut decoder = HandshakeDecoder::new();
    tokio::time::timeout(Duration::from_secs(5), read_packet(stream, &mut decoder))
        .await
        .expect("packet before deadline")
        .expect("well-formed packet")
}

/// Read a Login Disconnect and return its text
pub async fn disconnect_text(stream: &mut TcpStream) -> String {
    let packet = next_packet(stream).await;
    assert_eq!(packet.id, 0x00);
    let json: serde_json::Value = serde_json::from_str(&packet.leading_string(1 << 17).unwrap()).unwrap();
    json["text"].as_str().unwrap().to_string()
}

pub fn message(code: DenialCode) -> String {
    FriendlyConfig::default().messages.message(code).to_string()
}

/// A loopback listener standing in for a game server
pub async fn backend() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
