//! Pending-request bookkeeping: match inbound responses to waiting commands.

use std::collections::HashMap;

use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::io::{ControllerId, Response};

pub(crate) type ReplySender = oneshot::Sender<Result<Response, CommandError>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<Response, CommandError>>;

#[derive(Debug)]
struct PendingRequest {
    controller: ControllerId,
    reply: ReplySender,
}

#[derive(Debug, Default)]
struct CorrelatorState {
    pending: HashMap<u64, PendingRequest>,
    /// Most recently sent request per controller, for firmware that omits ids.
    active: HashMap<ControllerId, u64>,
}

/// What happened to an inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Matched the pending request with this id.
    Resolved(u64),
    /// Carried an id with no pending request (late reply after timeout, foreign id).
    Stale(u64),
    /// No id and no active request to attribute it to.
    Unmatched,
}

/// Process-wide map of pending requests keyed by correlation id.
///
/// The unlabelled-response fallback relies on the queue keeping at most one
/// request in flight per controller.
#[derive(Debug)]
pub struct Correlator {
    state: Mutex<CorrelatorState>,
    allow_unlabelled: bool,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Correlator {
    #[must_use]
    pub fn new(allow_unlabelled: bool) -> Self {
        Self {
            state: Mutex::new(CorrelatorState::default()),
            allow_unlabelled,
        }
    }

    /// Register a pending request and mark it active for its controller.
    pub(crate) fn register(&self, controller: &ControllerId, id: u64) -> ReplyReceiver {
        let (reply, receiver) = oneshot::channel();
        let mut state = self.state.lock();
        state.pending.insert(
            id,
            PendingRequest {
                controller: controller.clone(),
                reply,
            },
        );
        state.active.insert(controller.clone(), id);
        receiver
    }

    /// Route a response from `controller` to its pending request.
    pub fn resolve(&self, controller: &ControllerId, response: Response) -> Resolution {
        let mut state = self.state.lock();
        let id = match response.id {
            Some(id) => {
                let owned = state
                    .pending
                    .get(&id)
                    .is_some_and(|pending| &pending.controller == controller);
                if !owned {
                    drop(state);
                    warn!(controller = %controller, id, "response for unknown or expired request");
                    return Resolution::Stale(id);
                }
                id
            }
            None if self.allow_unlabelled => match state.active.get(controller).copied() {
                Some(id) => id,
                None => {
                    drop(state);
                    debug!(controller = %controller, "unlabelled response with no active request");
                    return Resolution::Unmatched;
                }
            },
            None => {
                drop(state);
                warn!(controller = %controller, "dropping unlabelled response (id echo required)");
                return Resolution::Unmatched;
            }
        };
        let Some(pending) = Self::take(&mut state, id) else {
            return Resolution::Unmatched;
        };
        drop(state);
        let outcome = if response.is_ok() {
            Ok(response)
        } else {
            Err(CommandError::Device {
                controller: controller.clone(),
                message: response
                    .error
                    .unwrap_or_else(|| SmolStr::new_inline("device reported an error")),
            })
        };
        // The waiter may have given up already; the entry is gone either way.
        let _ = pending.reply.send(outcome);
        Resolution::Resolved(id)
    }

    /// Drop a pending request without answering it (timeout, send failure).
    pub(crate) fn expire(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        Self::take(&mut state, id).is_some()
    }

    /// Reject the controller's active request, if any.
    pub(crate) fn fail_active(&self, controller: &ControllerId, error: CommandError) -> Option<u64> {
        let mut state = self.state.lock();
        let id = *state.active.get(controller)?;
        let pending = Self::take(&mut state, id)?;
        drop(state);
        let _ = pending.reply.send(Err(error));
        Some(id)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    #[must_use]
    pub fn is_pending(&self, id: u64) -> bool {
        self.state.lock().pending.contains_key(&id)
    }

    #[must_use]
    pub fn active_id(&self, controller: &str) -> Option<u64> {
        self.state.lock().active.get(controller).copied()
    }

    fn take(state: &mut CorrelatorState, id: u64) -> Option<PendingRequest> {
        let pending = state.pending.remove(&id)?;
        if state.active.get(&pending.controller) == Some(&id) {
            state.active.remove(&pending.controller);
        }
        Some(pending)
    }
}
