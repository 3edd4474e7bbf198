//! Lifecycle notifications for observers.

use serde::Serialize;
use serde_json::Value;
use smol_str::SmolStr;

pub use crate::command::CommandTrace;

use super::machine::{AutomationState, ControlEvent};

/// Fire-and-forget engine notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutomationEvent {
    StateChange {
        session: Option<SmolStr>,
        from: AutomationState,
        to: AutomationState,
        /// Control event that caused the change; `None` for run-loop outcomes.
        event: Option<ControlEvent>,
    },
    BlockStart {
        session: Option<SmolStr>,
        block: SmolStr,
        block_type: SmolStr,
    },
    BlockEnd {
        session: Option<SmolStr>,
        block: SmolStr,
        block_type: SmolStr,
        success: bool,
        output: Option<Value>,
        error: Option<SmolStr>,
    },
}

impl AutomationEvent {
    /// Target state when this is a state change.
    #[must_use]
    pub fn state_change_to(&self) -> Option<AutomationState> {
        match self {
            Self::StateChange { to, .. } => Some(*to),
            _ => None,
        }
    }
}
