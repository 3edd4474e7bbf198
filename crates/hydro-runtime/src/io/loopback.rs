//! Loopback transport for development and dry runs.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use smol_str::SmolStr;

use crate::error::CommandError;
use crate::io::{
    InboundMessage, Packet, Response, Transport, TransportEvent, TransportEvents, TransportFuture,
};

/// Answers every packet with `status: ok`, echoing its fields as `data`.
#[derive(Debug)]
pub struct LoopbackTransport {
    controller: SmolStr,
    events: TransportEvents,
    connected: AtomicBool,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new(controller: impl Into<SmolStr>, events: TransportEvents) -> Self {
        Self {
            controller: controller.into(),
            events,
            connected: AtomicBool::new(true),
        }
    }
}

impl Transport for LoopbackTransport {
    fn kind(&self) -> &str {
        "loopback"
    }

    fn send<'a>(&'a self, packet: &'a Packet) -> TransportFuture<'a, Result<(), CommandError>> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(CommandError::Disconnected(self.controller.clone()));
            }
            let data = packet
                .fields
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect::<serde_json::Map<_, _>>();
            let reply = Response::ok(Some(packet.id), Some(Value::Object(data)));
            self.events
                .send(TransportEvent::Message(InboundMessage::Response(reply)))
                .map_err(|_| CommandError::Disconnected(self.controller.clone()))
        })
    }

    fn disconnect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.connected.store(false, Ordering::SeqCst);
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
