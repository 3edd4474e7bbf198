//! Per-controller FIFO worker: one request in flight per physical link.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::io::{ControllerId, Packet, Response, Transport};

use super::correlator::{Correlator, ReplySender};
use super::manager::CommandTrace;

/// One send-task waiting for its turn on the link.
pub(crate) struct QueuedCommand {
    pub(crate) packet: Packet,
    pub(crate) timeout: Duration,
    pub(crate) reply: ReplySender,
}

/// Handle to a controller's queue; dropping it lets the worker drain and exit.
pub(crate) struct CommandQueue {
    controller: ControllerId,
    sender: mpsc::UnboundedSender<QueuedCommand>,
    worker: JoinHandle<()>,
}

impl CommandQueue {
    pub(crate) fn spawn(
        controller: ControllerId,
        transport: Arc<dyn Transport>,
        correlator: Arc<Correlator>,
        trace: broadcast::Sender<CommandTrace>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(drain(
            controller.clone(),
            receiver,
            transport,
            correlator,
            trace,
        ));
        Self {
            controller,
            sender,
            worker,
        }
    }

    /// Append to the FIFO. Fails only when the worker has already exited.
    pub(crate) fn submit(&self, command: QueuedCommand) -> Result<(), CommandError> {
        self.sender
            .send(command)
            .map_err(|_| CommandError::Disconnected(self.controller.clone()))
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.worker.is_finished()
    }
}

async fn drain(
    controller: ControllerId,
    mut receiver: mpsc::UnboundedReceiver<QueuedCommand>,
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
    trace: broadcast::Sender<CommandTrace>,
) {
    while let Some(command) = receiver.recv().await {
        let QueuedCommand {
            packet,
            timeout,
            reply,
        } = command;
        let result = dispatch(
            &controller,
            transport.as_ref(),
            &correlator,
            &trace,
            &packet,
            timeout,
        )
        .await;
        if let Err(err) = &result {
            debug!(controller = %controller, id = packet.id, cmd = %packet.cmd, "command failed: {err}");
        }
        // The caller may have stopped waiting; the outcome is still final.
        let _ = reply.send(result);
    }
    debug!(controller = %controller, "command queue closed");
}

async fn dispatch(
    controller: &ControllerId,
    transport: &dyn Transport,
    correlator: &Correlator,
    trace: &broadcast::Sender<CommandTrace>,
    packet: &Packet,
    timeout: Duration,
) -> Result<Response, CommandError> {
    if !transport.is_connected() {
        return Err(CommandError::Disconnected(controller.clone()));
    }
    let deadline = tokio::time::Instant::now() + timeout;
    let receiver = correlator.register(controller, packet.id);
    let exchange = async {
        if let Err(err) = transport.send(packet).await {
            correlator.expire(packet.id);
            return Err(err);
        }
        let _ = trace.send(CommandTrace {
            controller: controller.clone(),
            id: packet.id,
            cmd: packet.cmd.clone(),
        });
        match receiver.await {
            Ok(result) => result,
            // Entry removed without an answer (link torn down).
            Err(_) => Err(CommandError::Disconnected(controller.clone())),
        }
    };
    match tokio::time::timeout_at(deadline, exchange).await {
        Ok(result) => result,
        Err(_) => {
            correlator.expire(packet.id);
            let after_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(controller = %controller, id = packet.id, cmd = %packet.cmd, after_ms, "command timed out");
            Err(CommandError::Timeout {
                controller: controller.clone(),
                id: packet.id,
                after_ms,
            })
        }
    }
}
