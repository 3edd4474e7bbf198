//! Controller link cache: lazy connect, FIFO submission and eviction on close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ControllerConfig, HydroConfig, RuntimeSettings};
use crate::error::CommandError;
use crate::io::{
    ConnectRequest, ControllerId, InboundMessage, Packet, Response, Transport, TransportEvent,
    TransportRegistry,
};

use super::correlator::Correlator;
use super::queue::{CommandQueue, QueuedCommand};

const TRACE_CAPACITY: usize = 256;

/// Timeout and correlation policy for the command path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSettings {
    pub command_timeout: Duration,
    /// Budget for explicit health checks.
    pub ping_timeout: Duration,
    /// Disable attributing id-less responses to the active request.
    pub require_id_echo: bool,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self::from(&RuntimeSettings::default())
    }
}

impl From<&RuntimeSettings> for CommandSettings {
    fn from(settings: &RuntimeSettings) -> Self {
        Self {
            command_timeout: settings.command_timeout,
            ping_timeout: settings.ping_timeout,
            require_id_echo: settings.require_id_echo,
        }
    }
}

/// Published for every packet handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTrace {
    pub controller: ControllerId,
    pub id: u64,
    pub cmd: SmolStr,
}

struct ControllerLink {
    generation: u64,
    transport: Arc<dyn Transport>,
    queue: CommandQueue,
    pump: JoinHandle<()>,
}

impl ControllerLink {
    fn is_usable(&self) -> bool {
        self.transport.is_connected() && self.queue.is_running()
    }
}

#[derive(Default)]
struct LinkSlot {
    /// Serializes connection attempts so concurrent callers share one link.
    connecting: AsyncMutex<()>,
    link: Mutex<Option<Arc<ControllerLink>>>,
}

impl LinkSlot {
    fn current(&self) -> Option<Arc<ControllerLink>> {
        self.link.lock().clone().filter(|link| link.is_usable())
    }
}

struct ManagerInner {
    controllers: RwLock<IndexMap<ControllerId, ControllerConfig>>,
    registry: TransportRegistry,
    slots: Mutex<HashMap<ControllerId, Arc<LinkSlot>>>,
    correlator: Arc<Correlator>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    settings: CommandSettings,
    trace: broadcast::Sender<CommandTrace>,
}

impl ManagerInner {
    fn slot(&self, controller: &str) -> Arc<LinkSlot> {
        self.slots
            .lock()
            .entry(SmolStr::new(controller))
            .or_default()
            .clone()
    }

    fn existing_slot(&self, controller: &str) -> Option<Arc<LinkSlot>> {
        self.slots.lock().get(controller).cloned()
    }

    /// Remove the cached link if it is still the given generation.
    fn evict(&self, controller: &str, generation: u64) -> Option<Arc<ControllerLink>> {
        let slot = self.existing_slot(controller)?;
        let mut guard = slot.link.lock();
        if guard.as_ref().map(|link| link.generation) != Some(generation) {
            return None;
        }
        guard.take()
    }
}

/// Owns one transport and FIFO queue per controller.
///
/// Links are opened on first use and evicted when the transport reports an
/// error or close; the next command reconnects. Cloning shares the cache.
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("controllers", &self.inner.controllers.read().len())
            .field("connected", &self.connected_controllers())
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl TransportManager {
    #[must_use]
    pub fn new(settings: CommandSettings, registry: TransportRegistry) -> Self {
        let (trace, _) = broadcast::channel(TRACE_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                controllers: RwLock::new(IndexMap::new()),
                registry,
                slots: Mutex::new(HashMap::new()),
                correlator: Arc::new(Correlator::new(!settings.require_id_echo)),
                next_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                settings,
                trace,
            }),
        }
    }

    /// Build from a loaded configuration, registering every controller.
    #[must_use]
    pub fn from_config(config: &HydroConfig, registry: TransportRegistry) -> Self {
        let manager = Self::new(CommandSettings::from(&config.runtime), registry);
        for controller in config.controllers.values() {
            manager.register_controller(controller.clone());
        }
        manager
    }

    /// Add or replace a controller's stored connection settings.
    ///
    /// An existing link keeps running until it is disconnected.
    pub fn register_controller(&self, controller: ControllerConfig) {
        self.inner
            .controllers
            .write()
            .insert(controller.id.clone(), controller);
    }

    #[must_use]
    pub fn controller(&self, id: &str) -> Option<ControllerConfig> {
        self.inner.controllers.read().get(id).cloned()
    }

    #[must_use]
    pub fn settings(&self) -> CommandSettings {
        self.inner.settings
    }

    #[must_use]
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.inner.correlator
    }

    /// Receive a [`CommandTrace`] for every packet sent from now on.
    #[must_use]
    pub fn subscribe_trace(&self) -> broadcast::Receiver<CommandTrace> {
        self.inner.trace.subscribe()
    }

    /// Return the cached transport, connecting on first use.
    pub async fn get_or_connect_transport(
        &self,
        controller: &str,
    ) -> Result<Arc<dyn Transport>, CommandError> {
        Ok(self.link(controller).await?.transport.clone())
    }

    /// Send a command through the controller's FIFO with the default timeout.
    pub async fn enqueue_command(
        &self,
        controller: &str,
        packet: Packet,
    ) -> Result<Response, CommandError> {
        self.enqueue_command_with_timeout(controller, packet, self.inner.settings.command_timeout)
            .await
    }

    /// Send a command with a caller-chosen response budget.
    ///
    /// The packet id is overwritten with a fresh correlation id.
    pub async fn enqueue_command_with_timeout(
        &self,
        controller: &str,
        mut packet: Packet,
        timeout: Duration,
    ) -> Result<Response, CommandError> {
        let link = self.link(controller).await?;
        packet.id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();
        link.queue.submit(QueuedCommand {
            packet,
            timeout,
            reply,
        })?;
        drop(link);
        receiver
            .await
            .unwrap_or_else(|_| Err(CommandError::Disconnected(SmolStr::new(controller))))
    }

    /// Health check using the longer ping budget.
    pub async fn ping(&self, controller: &str) -> Result<Response, CommandError> {
        self.enqueue_command_with_timeout(
            controller,
            Packet::new("ping"),
            self.inner.settings.ping_timeout,
        )
        .await
    }

    /// Close and forget the controller's link; queued commands fail.
    pub async fn disconnect_controller(&self, controller: &str) {
        let Some(slot) = self.inner.existing_slot(controller) else {
            return;
        };
        let _connecting = slot.connecting.lock().await;
        let link = slot.link.lock().take();
        if let Some(link) = link {
            shutdown_link(&self.inner, controller, &link).await;
            info!(controller = %controller, "controller disconnected");
        }
    }

    pub async fn disconnect_all(&self) {
        let controllers: Vec<ControllerId> = self.inner.slots.lock().keys().cloned().collect();
        for controller in controllers {
            self.disconnect_controller(&controller).await;
        }
    }

    #[must_use]
    pub fn is_connected(&self, controller: &str) -> bool {
        self.inner
            .existing_slot(controller)
            .and_then(|slot| slot.current())
            .is_some()
    }

    #[must_use]
    pub fn connected_controllers(&self) -> Vec<ControllerId> {
        let slots: Vec<(ControllerId, Arc<LinkSlot>)> = self
            .inner
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        let mut connected: Vec<ControllerId> = slots
            .into_iter()
            .filter(|(_, slot)| slot.current().is_some())
            .map(|(id, _)| id)
            .collect();
        connected.sort();
        connected
    }

    async fn link(&self, controller: &str) -> Result<Arc<ControllerLink>, CommandError> {
        let slot = self.inner.slot(controller);
        if let Some(link) = slot.current() {
            return Ok(link);
        }
        let _connecting = slot.connecting.lock().await;
        if let Some(link) = slot.current() {
            return Ok(link);
        }
        let stale = slot.link.lock().take();
        if let Some(stale) = stale {
            shutdown_link(&self.inner, controller, &stale).await;
        }

        let config = self
            .controller(controller)
            .ok_or_else(|| CommandError::UnknownController(SmolStr::new(controller)))?;
        let (events, inbound) = mpsc::unbounded_channel();
        let transport: Arc<dyn Transport> = Arc::from(
            self.inner
                .registry
                .connect(ConnectRequest {
                    controller: config,
                    events,
                })
                .await?,
        );
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let controller_id = SmolStr::new(controller);
        let queue = CommandQueue::spawn(
            controller_id.clone(),
            transport.clone(),
            self.inner.correlator.clone(),
            self.inner.trace.clone(),
        );
        let pump = tokio::spawn(pump_events(
            Arc::downgrade(&self.inner),
            controller_id,
            generation,
            inbound,
        ));
        info!(controller = %controller, kind = transport.kind(), generation, "controller connected");
        let link = Arc::new(ControllerLink {
            generation,
            transport,
            queue,
            pump,
        });
        *slot.link.lock() = Some(link.clone());
        Ok(link)
    }
}

async fn shutdown_link(inner: &ManagerInner, controller: &str, link: &ControllerLink) {
    link.pump.abort();
    link.transport.disconnect().await;
    inner
        .correlator
        .fail_active(&SmolStr::new(controller), CommandError::Disconnected(controller.into()));
}

/// Route one link's inbound traffic until it closes.
async fn pump_events(
    inner: Weak<ManagerInner>,
    controller: ControllerId,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Message(InboundMessage::Response(response)) => {
                inner.correlator.resolve(&controller, response);
            }
            TransportEvent::Message(InboundMessage::Unsolicited(value)) => {
                debug!(controller = %controller, message = %value, "unsolicited message");
            }
            TransportEvent::Message(InboundMessage::Log(line)) => {
                debug!(controller = %controller, line = %line, "controller log");
            }
            TransportEvent::Error(message) => {
                warn!(controller = %controller, generation, "transport error: {message}");
                inner.correlator.fail_active(
                    &controller,
                    CommandError::Transport {
                        controller: controller.clone(),
                        message,
                    },
                );
                if let Some(link) = inner.evict(&controller, generation) {
                    warn!(controller = %controller, generation, "evicting link after error");
                    link.transport.disconnect().await;
                }
            }
            TransportEvent::Closed => {
                inner
                    .correlator
                    .fail_active(&controller, CommandError::Disconnected(controller.clone()));
                if let Some(link) = inner.evict(&controller, generation) {
                    warn!(controller = %controller, generation, "link closed, evicted");
                    link.transport.disconnect().await;
                }
                break;
            }
        }
    }
}
