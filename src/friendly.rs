//! Friendly responder: a tiny local server that tells a client why it
//! cannot reach its backend.
//!
//! One listener per [`DenialCode`]. The proxy forwards a denied client to
//! the listener for its reason through the ordinary forwarder, replaying the
//! client's bytes. Status pings get a server-list entry carrying the message;
//! logins get a Login Disconnect.

use crate::config::FriendlyConfig;
use crate::error::{Denial, DenialCode, HandshakeError};
use crate::handshake::{
    read_handshake, read_login_start, read_packet, with_deadline, write_packet, write_string,
    HandshakeDecoder, STATE_STATUS,
};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How long a client may take for each step of the exchange
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

const STATUS_RESPONSE: i32 = 0x00;
const PING: i32 = 0x01;
const LOGIN_DISCONNECT: i32 = 0x00;

struct Reply {
    denial: Denial,
    version_name: String,
}

impl Reply {
    fn status_json(&self, protocol_version: i32) -> String {
        json!({
            "version": { "name": self.version_name, "protocol": protocol_version },
            "players": { "max": 0, "online": 0 },
            "description": { "text": self.denial.message },
        })
        .to_string()
    }

    fn disconnect_json(&self) -> String {
        json!({ "text": self.denial.message }).to_string()
    }
}

/// Addresses of the running responder listeners
pub struct FriendlyResponder {
    targets: HashMap<DenialCode, SocketAddr>,
}

impl FriendlyResponder {
    /// Bind one listener per denial code and serve until shutdown
    pub async fn bind(config: &FriendlyConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let mut targets = HashMap::new();

        for (offset, code) in DenialCode::ALL.into_iter().enumerate() {
            let port = match config.base_port {
                0 => 0,
                base => base
                    .checked_add(offset as u16)
                    .ok_or_else(|| anyhow::anyhow!("friendly.base_port {} too high", base))?,
            };
            let listener = TcpListener::bind(SocketAddr::new(config.bind, port))
                .await
                .map_err(|e| anyhow::anyhow!("Failed to bind friendly responder for {}: {}", code, e))?;
            let addr = listener.local_addr()?;

            let reply = Arc::new(Reply {
                denial: Denial::new(code, config.messages.message(code)),
                version_name: config.version_name.clone(),
            });
            tokio::spawn(accept_loop(listener, reply, shutdown.clone()));
            targets.insert(code, addr);
        }

        info!(listeners = targets.len(), bind = %config.bind, "Friendly responder listening");
        Ok(Self { targets })
    }

    /// Where to forward a client denied for `code`
    pub fn target(&self, code: DenialCode) -> Option<SocketAddr> {
        self.targets.get(&code).copied()
    }
}

async fn accept_loop(listener: TcpListener, reply: Arc<Reply>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let reply = Arc::clone(&reply);
                        tokio::spawn(async move {
                            if let Err(e) = respond(stream, &reply).await {
                                debug!(code = %reply.denial.code, error = %e, "Friendly exchange ended early");
                            }
                        });
                    }
                    Err(e) => warn!(code = %reply.denial.code, error = %e, "Friendly accept failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn respond(mut stream: TcpStream, reply: &Reply) -> Result<(), HandshakeError> {
    let mut decoder = HandshakeDecoder::new();
    let handshake = with_deadline(Some(STEP_TIMEOUT), read_handshake(&mut stream, &mut decoder)).await?;
    let mut out = Vec::new();

    if handshake.next_state == STATE_STATUS {
        // Status Request carries no fields
        with_deadline(Some(STEP_TIMEOUT), read_packet(&mut stream, &mut decoder)).await?;

        let mut body = Vec::new();
        write_string(&mut body, &reply.status_json(handshake.protocol_version));
        write_packet(&mut out, STATUS_RESPONSE, &body);
        stream.write_all(&out).await?;

        let ping = with_deadline(Some(STEP_TIMEOUT), read_packet(&mut stream, &mut decoder)).await?;
        if ping.id == PING {
            out.clear();
            write_packet(&mut out, PING, &ping.body);
            stream.write_all(&out).await?;
        }
    } else {
        // Drain Login Start first so closing does not reset the connection
        if let Err(e) = with_deadline(Some(STEP_TIMEOUT), read_login_start(&mut stream, &mut decoder)).await {
            debug!(code = %reply.denial.code, error = %e, "No Login Start before disconnect");
        }

        let mut body = Vec::new();
        write_string(&mut body, &reply.disconnect_json());
        write_packet(&mut out, LOGIN_DISCONNECT, &body);
        stream.write_all(&out).await?;
    }

    stream.shutdown().await?;
    Ok(())
}
