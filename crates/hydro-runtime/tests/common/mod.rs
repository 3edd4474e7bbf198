#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use smol_str::SmolStr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use hydro_runtime::automation::{
    MemorySessionStore, SessionLogEntry, SessionRecord, SessionStore, StoreFuture,
};
use hydro_runtime::command::{CommandSettings, TransportManager};
use hydro_runtime::config::ControllerConfig;
use hydro_runtime::io::{
    encode_line, ConnectRequest, InboundMessage, Packet, Response, Transport, TransportEvent,
    TransportEvents, TransportFuture, TransportRegistry,
};
use hydro_runtime::{AutomationState, CommandError, RuntimeError};

/// Connection kind served by [`FakeHardware`].
pub const FAKE_CONNECTION: &str = "fake";

/// What the fake controller does with one packet.
#[derive(Debug, Clone)]
pub enum Reply {
    Now(Response),
    After(Duration, Response),
    Silent,
}

type Responder = Arc<dyn Fn(&Packet) -> Reply + Send + Sync>;

struct HardwareState {
    sent: Mutex<Vec<(SmolStr, Packet)>>,
    responder: Mutex<Responder>,
    links: Mutex<Vec<TransportEvents>>,
    connects: AtomicUsize,
}

/// Scripted controllers reachable through the `fake` connection kind.
///
/// Every packet is recorded; replies come from a swappable responder that
/// by default answers `ok` and echoes the id.
#[derive(Clone)]
pub struct FakeHardware {
    state: Arc<HardwareState>,
}

impl Default for FakeHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHardware {
    pub fn new() -> Self {
        Self {
            state: Arc::new(HardwareState {
                sent: Mutex::new(Vec::new()),
                responder: Mutex::new(Arc::new(|packet: &Packet| {
                    Reply::Now(Response::ok(Some(packet.id), None))
                })),
                links: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    pub fn respond_with(&self, responder: impl Fn(&Packet) -> Reply + Send + Sync + 'static) {
        *self.state.responder.lock() = Arc::new(responder);
    }

    pub fn registry(&self) -> TransportRegistry {
        let mut registry = TransportRegistry::default_registry();
        let state = self.state.clone();
        registry.register(
            FAKE_CONNECTION,
            Arc::new(move |request: ConnectRequest| connect_fake(state.clone(), request)),
            |_| Ok(()),
        );
        registry
    }

    pub fn manager(&self, controllers: &[&str]) -> TransportManager {
        self.manager_with(CommandSettings::default(), controllers)
    }

    pub fn manager_with(&self, settings: CommandSettings, controllers: &[&str]) -> TransportManager {
        let manager = TransportManager::new(settings, self.registry());
        for controller in controllers {
            manager.register_controller(ControllerConfig::new(*controller, FAKE_CONNECTION));
        }
        manager
    }

    pub fn sent(&self) -> Vec<(SmolStr, Packet)> {
        self.state.sent.lock().clone()
    }

    /// Sent packets as serial frames, e.g. `DIGITAL_WRITE|1_5|1`.
    pub fn frames(&self) -> Vec<String> {
        self.sent().iter().map(|(_, packet)| encode_line(packet)).collect()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Simulate a cable pull on every open link.
    pub fn close_links(&self) {
        for events in self.state.links.lock().drain(..) {
            let _ = events.send(TransportEvent::Closed);
        }
    }

    /// Push a frame on every open link as if the firmware sent it.
    pub fn inject(&self, message: InboundMessage) {
        for events in self.state.links.lock().iter() {
            let _ = events.send(TransportEvent::Message(message.clone()));
        }
    }
}

fn connect_fake(
    state: Arc<HardwareState>,
    request: ConnectRequest,
) -> TransportFuture<'static, Result<Box<dyn Transport>, CommandError>> {
    Box::pin(async move {
        state.connects.fetch_add(1, Ordering::SeqCst);
        state.links.lock().push(request.events.clone());
        let transport: Box<dyn Transport> = Box::new(FakeTransport {
            controller: request.controller.id.clone(),
            events: request.events,
            state,
            connected: Mutex::new(true),
        });
        Ok(transport)
    })
}

struct FakeTransport {
    controller: SmolStr,
    events: TransportEvents,
    state: Arc<HardwareState>,
    connected: Mutex<bool>,
}

impl Transport for FakeTransport {
    fn kind(&self) -> &str {
        FAKE_CONNECTION
    }

    fn send<'a>(&'a self, packet: &'a Packet) -> TransportFuture<'a, Result<(), CommandError>> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(CommandError::Disconnected(self.controller.clone()));
            }
            self.state
                .sent
                .lock()
                .push((self.controller.clone(), packet.clone()));
            let responder = self.state.responder.lock().clone();
            match responder(packet) {
                Reply::Now(response) => {
                    let _ = self
                        .events
                        .send(TransportEvent::Message(InboundMessage::Response(response)));
                }
                Reply::After(delay, response) => {
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = events.send(TransportEvent::Message(InboundMessage::Response(
                            response,
                        )));
                    });
                }
                Reply::Silent => {}
            }
            Ok(())
        })
    }

    fn disconnect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            *self.connected.lock() = false;
        })
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }
}

/// Reading reply for sensor tests.
pub fn reading(packet: &Packet, value: f64) -> Reply {
    Reply::Now(Response::ok(Some(packet.id), Some(json!({ "value": value }))))
}

/// Session store that counts resume-state writes and clears.
#[derive(Default)]
pub struct CountingSessions {
    inner: MemorySessionStore,
    pub writes: AtomicUsize,
    pub clears: AtomicUsize,
}

impl CountingSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl SessionStore for CountingSessions {
    fn create(&self, program_id: &str, now_ms: i64) -> StoreFuture<'_, Result<SessionRecord, RuntimeError>> {
        self.inner.create(program_id, now_ms)
    }

    fn load(&self, session: &str) -> StoreFuture<'_, Result<Option<SessionRecord>, RuntimeError>> {
        self.inner.load(session)
    }

    fn set_status(
        &self,
        session: &str,
        status: AutomationState,
        error: Option<SmolStr>,
        now_ms: i64,
    ) -> StoreFuture<'_, Result<(), RuntimeError>> {
        self.inner.set_status(session, status, error, now_ms)
    }

    fn set_resume_state(
        &self,
        session: &str,
        block: &str,
        state: Option<Value>,
    ) -> StoreFuture<'_, Result<(), RuntimeError>> {
        let counter = if state.is_some() {
            &self.writes
        } else {
            &self.clears
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.inner.set_resume_state(session, block, state)
    }

    fn clear_resume_state(&self, session: &str) -> StoreFuture<'_, Result<(), RuntimeError>> {
        self.inner.clear_resume_state(session)
    }

    fn append_log(
        &self,
        session: &str,
        entry: SessionLogEntry,
    ) -> StoreFuture<'_, Result<(), RuntimeError>> {
        self.inner.append_log(session, entry)
    }
}

/// Firmware on the far end of an in-memory serial cable.
///
/// Each received line goes to `handler`; a returned string is written back
/// with a newline. Lines in `banner` are written first.
pub fn spawn_serial_firmware(
    stream: DuplexStream,
    banner: &[&str],
    handler: impl Fn(&str) -> Option<String> + Send + 'static,
) -> (JoinHandle<()>, Arc<Mutex<Vec<String>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    let banner: Vec<String> = banner.iter().map(|line| format!("{line}\n")).collect();
    let task = tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(stream);
        for line in banner {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                return;
            }
        }
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log.lock().push(line.clone());
            if let Some(reply) = handler(&line) {
                let framed = format!("{reply}\n");
                if write_half.write_all(framed.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    });
    (task, received)
}

/// UDP controller on localhost. `handler` gets each datagram as text.
pub async fn spawn_udp_firmware(
    handler: impl Fn(&str) -> Vec<String> + Send + 'static,
) -> (SocketAddr, JoinHandle<()>, Arc<Mutex<Vec<String>>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind firmware");
    let addr = socket.local_addr().expect("firmware addr");
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let text = String::from_utf8_lossy(&buf[..len]).to_string();
            log.lock().push(text.clone());
            for reply in handler(&text) {
                let _ = socket.send_to(reply.as_bytes(), from).await;
            }
        }
    });
    (addr, task, received)
}

/// Echo the `id` of a JSON datagram in an `ok` reply.
pub fn ok_reply(datagram: &str, data: Value) -> String {
    let id = serde_json::from_str::<Value>(datagram)
        .ok()
        .and_then(|value| value.get("id").cloned())
        .unwrap_or(Value::Null);
    json!({ "id": id, "status": "ok", "data": data }).to_string()
}
