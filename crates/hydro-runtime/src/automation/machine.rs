//! Automation lifecycle state machine.
//!
//! Pure transitions only: the engine owns timers, I/O and persistence and
//! calls into the machine to move between states.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::RuntimeError;

use super::graph::ProgramGraph;
use super::types::{ExecutionContext, ExecutionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutomationState {
    Idle,
    Loaded,
    Running,
    Paused,
    Stopped,
    Error,
    Completed,
}

impl AutomationState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loaded => "loaded",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Completed => "completed",
        }
    }

    /// Stopped, errored or completed: a run ended and may be restarted.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Stopped | Self::Error | Self::Completed)
    }
}

impl fmt::Display for AutomationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlEvent {
    Load,
    Start,
    Pause,
    Resume,
    Stop,
    Unload,
}

impl ControlEvent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Unload => "unload",
        }
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: AutomationState,
    pub to: AutomationState,
}

/// Loaded graph plus the run's position and context.
#[derive(Debug, Clone, Default)]
pub struct AutomationContext {
    pub exec: ExecutionContext,
    pub graph: Option<Arc<ProgramGraph>>,
    /// `None` while running means the run finished normally.
    pub current_block: Option<SmolStr>,
    pub error: Option<SmolStr>,
    /// Block that failed the run, if any.
    pub failed_block: Option<SmolStr>,
}

#[derive(Debug, Clone)]
pub struct AutomationMachine {
    state: AutomationState,
    context: AutomationContext,
}

impl Default for AutomationMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AutomationMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AutomationState::Idle,
            context: AutomationContext::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> AutomationState {
        self.state
    }

    #[must_use]
    pub fn context(&self) -> &AutomationContext {
        &self.context
    }

    #[must_use]
    pub fn graph(&self) -> Option<&Arc<ProgramGraph>> {
        self.context.graph.as_ref()
    }

    #[must_use]
    pub fn current_block(&self) -> Option<&SmolStr> {
        self.context.current_block.as_ref()
    }

    /// LOAD: install a graph with a fresh execution context.
    pub fn load(&mut self, graph: Arc<ProgramGraph>) -> Result<Transition, RuntimeError> {
        self.guard(ControlEvent::Load, |state| {
            matches!(
                state,
                AutomationState::Idle
                    | AutomationState::Stopped
                    | AutomationState::Error
                    | AutomationState::Completed
            )
        })?;
        self.context = AutomationContext {
            exec: ExecutionContext::for_program(graph.variables()),
            current_block: Some(graph.entry().clone()),
            graph: Some(graph),
            error: None,
            failed_block: None,
        };
        Ok(self.enter(AutomationState::Loaded))
    }

    /// START: begin a run. Restarting a finished run starts over.
    pub fn start(&mut self, now_ms: i64) -> Result<Transition, RuntimeError> {
        self.guard(ControlEvent::Start, |state| {
            matches!(
                state,
                AutomationState::Loaded | AutomationState::Stopped | AutomationState::Completed
            )
        })?;
        if self.state != AutomationState::Loaded {
            self.rewind();
        }
        self.discard_resume_state();
        self.context.exec.start_time_ms = Some(now_ms);
        Ok(self.enter(AutomationState::Running))
    }

    pub fn pause(&mut self) -> Result<Transition, RuntimeError> {
        self.guard(ControlEvent::Pause, |state| state == AutomationState::Running)?;
        Ok(self.enter(AutomationState::Paused))
    }

    /// RESUME: back to running on the same current block.
    pub fn resume(&mut self) -> Result<Transition, RuntimeError> {
        self.guard(ControlEvent::Resume, |state| state == AutomationState::Paused)?;
        Ok(self.enter(AutomationState::Running))
    }

    /// STOP: end a running or paused run; also acknowledges an errored one.
    pub fn stop(&mut self) -> Result<Transition, RuntimeError> {
        self.guard(ControlEvent::Stop, |state| {
            matches!(
                state,
                AutomationState::Running | AutomationState::Paused | AutomationState::Error
            )
        })?;
        self.discard_resume_state();
        Ok(self.enter(AutomationState::Stopped))
    }

    /// UNLOAD: discard the graph from any non-running state.
    pub fn unload(&mut self) -> Result<Transition, RuntimeError> {
        self.guard(ControlEvent::Unload, |state| {
            !matches!(state, AutomationState::Running | AutomationState::Paused)
        })?;
        self.context = AutomationContext::default();
        Ok(self.enter(AutomationState::Idle))
    }

    /// Drop every block's saved state; the next run starts each block fresh.
    pub fn discard_resume_state(&mut self) {
        self.context.exec.resume_state.clear();
    }

    /// Store the context produced by a step. Accepted in any state so work
    /// finished just before a PAUSE/STOP is not lost.
    pub fn commit(&mut self, exec: ExecutionContext) {
        self.context.exec = exec;
    }

    /// Move to the next block; `None` completes the run when still running.
    pub fn advance(&mut self, next: Option<SmolStr>) -> Option<Transition> {
        self.context.current_block = next;
        self.finish_if_done()
    }

    /// Complete a running machine whose current block is `None`.
    pub fn finish_if_done(&mut self) -> Option<Transition> {
        (self.state == AutomationState::Running && self.context.current_block.is_none())
            .then(|| self.enter(AutomationState::Completed))
    }

    /// Record a block failure; only a running machine moves to `error`.
    pub fn fail(&mut self, block: &SmolStr, error: &RuntimeError, now_ms: i64) -> Option<Transition> {
        let message = SmolStr::new(error.to_string());
        self.context.exec.errors.push(ExecutionError {
            block: block.clone(),
            message: message.clone(),
            at_ms: now_ms,
        });
        if self.state != AutomationState::Running {
            return None;
        }
        self.context.error = Some(message);
        self.context.failed_block = Some(block.clone());
        Some(self.enter(AutomationState::Error))
    }

    fn rewind(&mut self) {
        let Some(graph) = self.context.graph.clone() else {
            return;
        };
        self.context.exec.reset_run();
        self.context.exec.active_resources.clear();
        self.context.current_block = Some(graph.entry().clone());
        self.context.error = None;
        self.context.failed_block = None;
    }

    fn guard(
        &self,
        event: ControlEvent,
        allowed: impl Fn(AutomationState) -> bool,
    ) -> Result<(), RuntimeError> {
        if allowed(self.state) {
            Ok(())
        } else {
            Err(RuntimeError::transition(self.state, event.as_str()))
        }
    }

    fn enter(&mut self, to: AutomationState) -> Transition {
        let from = std::mem::replace(&mut self.state, to);
        Transition { from, to }
    }
}
