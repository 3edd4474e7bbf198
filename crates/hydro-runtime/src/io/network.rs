//! UDP datagram transport: one command per datagram, one reply per datagram.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use smol_str::SmolStr;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ControllerConfig;
use crate::error::{CommandError, RuntimeError};
use crate::io::{
    classify_frame, InboundMessage, Packet, Transport, TransportEvent, TransportEvents,
    TransportFuture,
};

const MAX_DATAGRAM: usize = 2048;
const KEYWORD_COMMANDS: &[&str] = &["ping", "status"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Controller `host:port`.
    pub address: String,
    /// Local bind address; port 0 picks an ephemeral port.
    pub bind: Option<SocketAddr>,
}

#[derive(Debug, Deserialize)]
struct NetworkToml {
    address: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    bind: Option<String>,
}

impl NetworkConfig {
    pub fn from_params(value: &toml::Value) -> Result<Self, RuntimeError> {
        let params: NetworkToml = value
            .clone()
            .try_into()
            .map_err(|err| RuntimeError::InvalidConfig(format!("network params: {err}").into()))?;
        let address = match (params.address, params.host, params.port) {
            (Some(address), _, _) => address,
            (None, Some(host), Some(port)) => format!("{host}:{port}"),
            _ => {
                return Err(RuntimeError::InvalidConfig(
                    "network params.address (or host + port) is required".into(),
                ))
            }
        };
        let valid_port = address
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid_port {
            return Err(RuntimeError::InvalidConfig(
                format!("network params.address '{address}' must be host:port").into(),
            ));
        }
        let bind = params
            .bind
            .map(|bind| {
                bind.parse::<SocketAddr>().map_err(|err| {
                    RuntimeError::InvalidConfig(format!("network params.bind: {err}").into())
                })
            })
            .transpose()?;
        Ok(Self { address, bind })
    }

    pub fn validate_params(value: &toml::Value) -> Result<(), RuntimeError> {
        let _ = Self::from_params(value)?;
        Ok(())
    }
}

/// Connectionless link: "connected" means bound and listening for replies.
pub struct NetworkTransport {
    controller: SmolStr,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    connected: Arc<AtomicBool>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for NetworkTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkTransport")
            .field("controller", &self.controller)
            .field("target", &self.target)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl NetworkTransport {
    pub async fn open(
        controller: &ControllerConfig,
        events: TransportEvents,
    ) -> Result<Self, CommandError> {
        let connect_err = |message: String| CommandError::Connect {
            controller: controller.id.clone(),
            message: message.into(),
        };
        let config =
            NetworkConfig::from_params(&controller.params).map_err(|err| connect_err(err.to_string()))?;
        let target = tokio::net::lookup_host(config.address.as_str())
            .await
            .map_err(|err| connect_err(format!("resolve {}: {err}", config.address)))?
            .next()
            .ok_or_else(|| connect_err(format!("resolve {}: no address", config.address)))?;
        let bind = config.bind.unwrap_or_else(|| {
            if target.is_ipv4() {
                SocketAddr::from(([0, 0, 0, 0], 0))
            } else {
                SocketAddr::from(([0u16; 8], 0))
            }
        });
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|err| connect_err(format!("bind {bind}: {err}")))?;
        debug!(
            controller = %controller.id,
            target = %target,
            local = ?socket.local_addr().ok(),
            "udp link ready"
        );
        Ok(Self::from_socket(controller.id.clone(), socket, target, events))
    }

    /// Wrap an already-bound socket.
    pub fn from_socket(
        controller: SmolStr,
        socket: UdpSocket,
        target: SocketAddr,
        events: TransportEvents,
    ) -> Self {
        let socket = Arc::new(socket);
        let connected = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_datagrams(
            controller.clone(),
            socket.clone(),
            target,
            events,
            connected.clone(),
        ));
        Self {
            controller,
            socket,
            target,
            connected,
            reader: parking_lot::Mutex::new(Some(reader)),
        }
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

impl Transport for NetworkTransport {
    fn kind(&self) -> &str {
        "network"
    }

    fn send<'a>(&'a self, packet: &'a Packet) -> TransportFuture<'a, Result<(), CommandError>> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(CommandError::Disconnected(self.controller.clone()));
            }
            let payload = encode_datagram(packet).map_err(|err| CommandError::Transport {
                controller: self.controller.clone(),
                message: format!("encode: {err}").into(),
            })?;
            debug!(controller = %self.controller, id = packet.id, bytes = payload.len(), "udp tx");
            self.socket
                .send_to(&payload, self.target)
                .await
                .map_err(|err| CommandError::Transport {
                    controller: self.controller.clone(),
                    message: format!("udp send: {err}").into(),
                })?;
            Ok(())
        })
    }

    fn disconnect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.connected.store(false, Ordering::SeqCst);
            if let Some(reader) = self.reader.lock().take() {
                reader.abort();
            }
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn read_datagrams(
    controller: SmolStr,
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    events: TransportEvents,
    connected: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if from.ip() != target.ip() {
                    warn!(controller = %controller, from = %from, "dropping datagram from unexpected peer");
                    continue;
                }
                let text = String::from_utf8_lossy(&buf[..len]);
                match classify_frame(&text) {
                    InboundMessage::Log(_) => {
                        warn!(controller = %controller, bytes = len, "dropping malformed datagram");
                    }
                    message => {
                        if events.send(TransportEvent::Message(message)).is_err() {
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(controller = %controller, "udp receive failed: {err}");
                let _ = events.send(TransportEvent::Error(format!("udp receive: {err}").into()));
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = events.send(TransportEvent::Closed);
}

/// Encode one datagram: bare keywords as plain text, everything else as JSON.
pub fn encode_datagram(packet: &Packet) -> Result<Vec<u8>, serde_json::Error> {
    let keyword = packet.cmd.to_ascii_lowercase();
    if packet.is_bare() && KEYWORD_COMMANDS.contains(&keyword.as_str()) {
        return Ok(keyword.to_ascii_uppercase().into_bytes());
    }
    serde_json::to_vec(packet)
}
