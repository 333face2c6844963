//! Byte-level forwarding between a client and a backend

use crate::error::ForwardError;
use crate::session::{SessionInfo, SessionRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const PUMP_BUFFER: usize = 16 * 1024;

/// Byte counts for a finished session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
    pub duration: Duration,
}

/// Connects to backends, replays buffered client bytes, and splices sockets
#[derive(Clone)]
pub struct Forwarder {
    registry: Arc<SessionRegistry>,
    connect_timeout: Duration,
}

impl Forwarder {
    pub fn new(registry: Arc<SessionRegistry>, connect_timeout: Duration) -> Self {
        Self {
            registry,
            connect_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Open a backend connection, bounded by the connect timeout
    pub async fn connect(&self, target: &str) -> Result<TcpStream, ForwardError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(source)) => Err(ForwardError::Connect {
                target: target.to_string(),
                source,
            }),
            Err(_) => Err(ForwardError::ConnectTimeout {
                target: target.to_string(),
                timeout: self.connect_timeout,
            }),
        }
    }

    /// Write `buffered` to the backend unchanged, then copy in both
    /// directions until either side closes. Both sockets are closed on return.
    pub async fn splice(
        &self,
        mut client: TcpStream,
        mut backend: TcpStream,
        buffered: &[u8],
        info: SessionInfo,
    ) -> Result<ForwardStats, ForwardError> {
        let started = Instant::now();
        let backend_name = info.backend.clone();

        backend
            .write_all(buffered)
            .await
            .map_err(|source| ForwardError::Replay {
                target: backend_name.clone(),
                source,
            })?;

        let guard = self.registry.register(info);
        let _ = client.set_nodelay(true);

        let (mut client_rx, mut client_tx) = client.split();
        let (mut backend_rx, mut backend_tx) = backend.split();
        let mut up = buffered.len() as u64;
        let mut down = 0u64;

        let (closed_by, result) = tokio::select! {
            r = pump(&mut client_rx, &mut backend_tx, &mut up) => ("client", r),
            r = pump(&mut backend_rx, &mut client_tx, &mut down) => ("backend", r),
        };

        let stats = ForwardStats {
            client_to_backend: up,
            backend_to_client: down,
            duration: started.elapsed(),
        };
        debug!(
            session = %guard.id(),
            backend = %backend_name,
            closed_by,
            error = ?result.err(),
            client_to_backend = stats.client_to_backend,
            backend_to_client = stats.backend_to_client,
            duration_ms = stats.duration.as_millis() as u64,
            "Session ended"
        );
        Ok(stats)
    }

    /// Connect to `target` and splice. A connect failure drops the client.
    pub async fn forward(
        &self,
        client: TcpStream,
        target: &str,
        buffered: &[u8],
        info: SessionInfo,
    ) -> Result<ForwardStats, ForwardError> {
        let backend = self.connect(target).await?;
        self.splice(client, backend, buffered, info).await
    }
}

/// Copy until EOF or error, counting bytes written
async fn pump<R, W>(from: &mut R, to: &mut W, total: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        to.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}
