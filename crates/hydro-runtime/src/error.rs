//! Runtime and hardware command errors.

#![allow(missing_docs)]

use smol_str::SmolStr;
use thiserror::Error;

/// Errors raised by the command transport path for one controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// No response arrived within the request budget.
    #[error("controller '{controller}' did not answer command {id} within {after_ms} ms")]
    Timeout {
        controller: SmolStr,
        id: u64,
        after_ms: u64,
    },

    /// The controller answered with `status: error`.
    #[error("{message}")]
    Device {
        controller: SmolStr,
        message: SmolStr,
    },

    /// Write/read failure on an established link.
    #[error("transport error on '{controller}': {message}")]
    Transport {
        controller: SmolStr,
        message: SmolStr,
    },

    /// The link could not be opened.
    #[error("connect '{controller}' failed: {message}")]
    Connect {
        controller: SmolStr,
        message: SmolStr,
    },

    /// The link closed while the command was pending or queued.
    #[error("controller '{0}' disconnected")]
    Disconnected(SmolStr),

    /// No connector registered for the controller's connection kind.
    #[error("unsupported connection type '{0}'")]
    UnsupportedConnection(SmolStr),

    /// Controller id is not configured.
    #[error("unknown controller '{0}'")]
    UnknownController(SmolStr),
}

impl CommandError {
    /// True when the device never answered (as opposed to answering with an error).
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Controller the error belongs to, if known.
    #[must_use]
    pub fn controller(&self) -> Option<&str> {
        match self {
            Self::Timeout { controller, .. }
            | Self::Device { controller, .. }
            | Self::Transport { controller, .. }
            | Self::Connect { controller, .. } => Some(controller.as_str()),
            Self::Disconnected(controller) | Self::UnknownController(controller) => {
                Some(controller.as_str())
            }
            Self::UnsupportedConnection(_) => None,
        }
    }
}

/// Runtime errors for configuration, program loading and execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// Configuration error.
    #[error("invalid config '{0}'")]
    InvalidConfig(SmolStr),

    /// Program definition rejected at load time.
    #[error("invalid program '{0}'")]
    InvalidProgram(SmolStr),

    /// Block id not present in the loaded graph.
    #[error("unknown block '{0}'")]
    UnknownBlock(SmolStr),

    /// Device id not present in the device snapshot.
    #[error("unknown device '{0}'")]
    UnknownDevice(SmolStr),

    /// Controller id not configured.
    #[error("unknown controller '{0}'")]
    UnknownController(SmolStr),

    /// Control event not valid in the current automation state.
    #[error("cannot {event} while {from}")]
    InvalidTransition { from: SmolStr, event: SmolStr },

    /// No executor registered for a block type.
    #[error("no executor registered for block type '{0}'")]
    NoExecutor(SmolStr),

    /// Block parameters missing or malformed.
    #[error("block '{block}': {message}")]
    InvalidParams { block: SmolStr, message: SmolStr },

    /// Execution was cancelled before the block finished.
    #[error("cancelled")]
    Cancelled,

    /// Run exceeded the configured step budget.
    #[error("step limit of {0} exceeded")]
    StepLimit(u64),

    /// Block failed for a reason reported by its executor.
    #[error("block '{block}' failed: {message}")]
    BlockFailed { block: SmolStr, message: SmolStr },

    /// Session storage error.
    #[error("session store error '{0}'")]
    SessionStore(SmolStr),

    /// Program source error.
    #[error("program source error '{0}'")]
    ProgramSource(SmolStr),

    /// Hardware command failed.
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl RuntimeError {
    pub(crate) fn params(block: &str, message: impl Into<SmolStr>) -> Self {
        Self::InvalidParams {
            block: SmolStr::new(block),
            message: message.into(),
        }
    }

    pub(crate) fn transition(from: impl std::fmt::Display, event: &str) -> Self {
        Self::InvalidTransition {
            from: SmolStr::new(from.to_string()),
            event: SmolStr::new(event),
        }
    }

    /// True for the cancellation marker rather than a real failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
