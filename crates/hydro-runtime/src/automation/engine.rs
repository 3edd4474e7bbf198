//! Automation engine: owns the state machine and drives the run loop.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use smol_str::SmolStr;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{MonotonicClock, SharedClock};
use crate::command::TransportManager;
use crate::config::RuntimeSettings;
use crate::error::RuntimeError;

use super::devices::{DeviceDirectory, IdentityConverter, SensorConverter, StaticDevices};
use super::events::AutomationEvent;
use super::executors::{BlockOutcome, ExecutorRegistry, NextBlock, StepContext};
use super::graph::{ProgramGraph, ProgramSource};
use super::machine::{AutomationMachine, AutomationState, ControlEvent, Transition};
use super::session::{MemorySessionStore, SessionLogEntry, SessionStore};
use super::types::{ActiveResource, Block, ExecutionContext};
use super::StoreFuture;

const EVENT_CAPACITY: usize = 512;

/// Collaborators injected into the engine.
#[derive(Clone)]
pub struct AutomationServices {
    pub hardware: TransportManager,
    pub programs: Arc<dyn ProgramSource>,
    pub sessions: Arc<dyn SessionStore>,
    pub devices: Arc<dyn DeviceDirectory>,
    pub converter: Arc<dyn SensorConverter>,
    pub clock: SharedClock,
}

impl AutomationServices {
    /// In-memory sessions, no devices, identity conversion, monotonic clock.
    #[must_use]
    pub fn new(hardware: TransportManager, programs: Arc<dyn ProgramSource>) -> Self {
        Self {
            hardware,
            programs,
            sessions: Arc::new(MemorySessionStore::new()),
            devices: Arc::new(StaticDevices::default()),
            converter: Arc::new(IdentityConverter),
            clock: Arc::new(MonotonicClock::new()),
        }
    }

    #[must_use]
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = sessions;
        self
    }

    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn DeviceDirectory>) -> Self {
        self.devices = devices;
        self
    }

    #[must_use]
    pub fn with_converter(mut self, converter: Arc<dyn SensorConverter>) -> Self {
        self.converter = converter;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Blocks executed per run before failing with `StepLimit`; 0 disables.
    pub max_steps: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&RuntimeSettings::default())
    }
}

impl From<&RuntimeSettings> for EngineSettings {
    fn from(settings: &RuntimeSettings) -> Self {
        Self {
            max_steps: settings.max_steps,
        }
    }
}

/// Point-in-time view for schedulers and UIs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutomationSnapshot {
    pub state: AutomationState,
    pub program_id: Option<SmolStr>,
    pub session_id: Option<SmolStr>,
    pub current_block: Option<SmolStr>,
    pub error: Option<SmolStr>,
    pub failed_block: Option<SmolStr>,
    pub context: ExecutionContext,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct EngineInner {
    services: AutomationServices,
    executors: ExecutorRegistry,
    settings: EngineSettings,
    machine: Mutex<AutomationMachine>,
    session: Mutex<Option<SmolStr>>,
    /// Serializes control events; holds the active run loop.
    control: AsyncMutex<Option<RunHandle>>,
    events: broadcast::Sender<AutomationEvent>,
    idle: watch::Sender<bool>,
}

/// Runs one loaded program at a time.
///
/// Control methods are serialized. PAUSE and STOP cancel the in-flight block
/// and wait for the run loop to exit before returning, so a following RESUME
/// always sees the state the paused block saved.
#[derive(Clone)]
pub struct AutomationEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for AutomationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let machine = self.inner.machine.lock();
        f.debug_struct("AutomationEngine")
            .field("state", &machine.state())
            .field("current_block", &machine.current_block())
            .field("executors", &self.inner.executors)
            .finish_non_exhaustive()
    }
}

impl AutomationEngine {
    #[must_use]
    pub fn new(
        services: AutomationServices,
        executors: ExecutorRegistry,
        settings: EngineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(EngineInner {
                services,
                executors,
                settings,
                machine: Mutex::new(AutomationMachine::new()),
                session: Mutex::new(None),
                control: AsyncMutex::new(None),
                events,
                idle,
            }),
        }
    }

    /// Engine with the built-in executors and default settings.
    #[must_use]
    pub fn with_services(services: AutomationServices) -> Self {
        Self::new(services, ExecutorRegistry::standard(), EngineSettings::default())
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AutomationEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> AutomationState {
        self.inner.machine.lock().state()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<SmolStr> {
        self.inner.session.lock().clone()
    }

    #[must_use]
    pub fn get_snapshot(&self) -> AutomationSnapshot {
        let session_id = self.session_id();
        let machine = self.inner.machine.lock();
        let context = machine.context();
        AutomationSnapshot {
            state: machine.state(),
            program_id: context.graph.as_ref().map(|graph| graph.program_id.clone()),
            session_id,
            current_block: context.current_block.clone(),
            error: context.error.clone(),
            failed_block: context.failed_block.clone(),
            context: context.exec.clone(),
        }
    }

    /// LOAD: fetch, validate and install a program; returns the new session id.
    pub async fn load_program(&self, program_id: &str) -> Result<SmolStr, RuntimeError> {
        let mut control = self.inner.control.lock().await;
        let state = self.state();
        if !matches!(state, AutomationState::Running | AutomationState::Paused) {
            settle(&mut control).await;
        }
        let definition = self.inner.services.programs.load(program_id).await?;
        let graph = ProgramGraph::build(&definition, |block_type| {
            self.inner.executors.contains(block_type)
        })?;
        let transition = self.inner.machine.lock().load(Arc::new(graph))?;
        *self.inner.session.lock() = None;

        let now = self.inner.services.clock.now_ms();
        let record = self.inner.services.sessions.create(program_id, now).await?;
        *self.inner.session.lock() = Some(record.id.clone());
        info!(program = %program_id, session = %record.id, "program loaded");
        self.inner.emit_state(transition, Some(ControlEvent::Load));
        Ok(record.id)
    }

    /// START: run from the entry block (a finished run starts over).
    pub async fn start_program(&self) -> Result<(), RuntimeError> {
        let mut control = self.inner.control.lock().await;
        if self.state() != AutomationState::Running {
            settle(&mut control).await;
        }
        let now = self.inner.services.clock.now_ms();
        let transition = self.inner.machine.lock().start(now)?;
        if let Some(session) = self.session_id() {
            let sessions = &self.inner.services.sessions;
            persist("clear resume state", sessions.clear_resume_state(&session)).await;
            persist(
                "status",
                sessions.set_status(&session, AutomationState::Running, None, now),
            )
            .await;
        }
        info!(session = ?self.session_id(), "program started");
        self.inner.emit_state(transition, Some(ControlEvent::Start));
        *control = Some(self.spawn_run());
        Ok(())
    }

    /// PAUSE: cancel the current block, keeping any state it saved.
    pub async fn pause_program(&self) -> Result<(), RuntimeError> {
        let mut control = self.inner.control.lock().await;
        let transition = self.inner.machine.lock().pause()?;
        if let Some(run) = control.take() {
            run.cancel.cancel();
            let _ = run.task.await;
        }
        self.inner.persist_status(AutomationState::Paused, None).await;
        info!(
            block = ?self.inner.machine.lock().current_block(),
            "program paused"
        );
        self.inner.emit_state(transition, Some(ControlEvent::Pause));
        Ok(())
    }

    /// RESUME: re-run the current block, which picks up its saved state.
    pub async fn resume_program(&self) -> Result<(), RuntimeError> {
        let mut control = self.inner.control.lock().await;
        let transition = self.inner.machine.lock().resume()?;
        settle(&mut control).await;
        self.inner
            .persist_status(AutomationState::Running, None)
            .await;
        info!("program resumed");
        self.inner.emit_state(transition, Some(ControlEvent::Resume));
        *control = Some(self.spawn_run());
        Ok(())
    }

    /// STOP: cancel the run, roll back devices it left changed and forget
    /// any saved block state.
    pub async fn stop_program(&self) -> Result<(), RuntimeError> {
        let mut control = self.inner.control.lock().await;
        let transition = self.inner.machine.lock().stop()?;
        if let Some(run) = control.take() {
            run.cancel.cancel();
            let _ = run.task.await;
        }
        // The cancelled step may have committed state after the transition.
        self.inner.machine.lock().discard_resume_state();
        if let Some(session) = self.session_id() {
            persist(
                "clear resume state",
                self.inner.services.sessions.clear_resume_state(&session),
            )
            .await;
        }
        self.inner.rollback().await;
        self.inner.persist_status(AutomationState::Stopped, None).await;
        info!("program stopped");
        self.inner.emit_state(transition, Some(ControlEvent::Stop));
        Ok(())
    }

    /// UNLOAD: discard the loaded program.
    pub async fn unload_program(&self) -> Result<(), RuntimeError> {
        let mut control = self.inner.control.lock().await;
        let transition = self.inner.machine.lock().unload()?;
        settle(&mut control).await;
        *self.inner.session.lock() = None;
        info!("program unloaded");
        self.inner.emit_state(transition, Some(ControlEvent::Unload));
        Ok(())
    }

    /// Wait until no run loop is active (finished, paused, stopped or failed).
    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    fn spawn_run(&self) -> RunHandle {
        let cancel = CancellationToken::new();
        self.inner.idle.send_replace(false);
        let task = tokio::spawn(run_loop(self.inner.clone(), cancel.clone()));
        RunHandle { cancel, task }
    }
}

/// Join a run loop that already left the running state.
async fn settle(slot: &mut Option<RunHandle>) {
    if let Some(run) = slot.take() {
        let _ = run.task.await;
    }
}

async fn persist(action: &str, write: StoreFuture<'_, Result<(), RuntimeError>>) {
    if let Err(err) = write.await {
        warn!("session {action} failed: {err}");
    }
}

impl EngineInner {
    fn emit(&self, event: AutomationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_state(&self, transition: Transition, event: Option<ControlEvent>) {
        debug!(from = %transition.from, to = %transition.to, "state change");
        self.emit(AutomationEvent::StateChange {
            session: self.session.lock().clone(),
            from: transition.from,
            to: transition.to,
            event,
        });
    }

    async fn persist_status(&self, status: AutomationState, error: Option<SmolStr>) {
        let session = self.session.lock().clone();
        if let Some(session) = session {
            let now = self.services.clock.now_ms();
            persist(
                "status",
                self.services.sessions.set_status(&session, status, error, now),
            )
            .await;
        }
    }

    /// Best-effort revert of every device the run left changed.
    async fn rollback(&self) {
        let resources: IndexMap<SmolStr, ActiveResource> = {
            let mut machine = self.machine.lock();
            let mut exec = machine.context().exec.clone();
            let resources = std::mem::take(&mut exec.active_resources);
            machine.commit(exec);
            resources
        };
        if resources.is_empty() {
            return;
        }
        let devices = self.services.devices.snapshot();
        for resource in resources.values().filter(|resource| resource.revert_on_stop) {
            let Some(device) = devices.get(&resource.device) else {
                warn!(device = %resource.device, "cannot revert unknown device");
                continue;
            };
            let result = match device.write_packet(resource.previous_state) {
                Ok(packet) => self
                    .services
                    .hardware
                    .enqueue_command(&device.controller, packet)
                    .await
                    .map_err(RuntimeError::from),
                Err(err) => Err(err),
            };
            match result {
                Ok(_) => info!(device = %device.id, state = resource.previous_state, "device reverted"),
                Err(err) => warn!(device = %device.id, "device revert failed: {err}"),
            }
        }
    }

    async fn record_block_end(
        &self,
        session: Option<&SmolStr>,
        block: &Block,
        success: bool,
        output: Option<Value>,
        error: Option<SmolStr>,
    ) {
        if let Some(session) = session {
            let entry = SessionLogEntry {
                at_ms: self.services.clock.now_ms(),
                block: block.id.clone(),
                block_type: block.block_type.clone(),
                success,
                output: output.clone(),
                error: error.clone(),
            };
            persist("log", self.services.sessions.append_log(session, entry)).await;
        }
        self.emit(AutomationEvent::BlockEnd {
            session: session.cloned(),
            block: block.id.clone(),
            block_type: block.block_type.clone(),
            success,
            output,
            error,
        });
    }

    /// Tail of a run that ended on its own (completed or failed).
    async fn finish_run(&self, transition: Transition) {
        if transition.to == AutomationState::Error {
            self.rollback().await;
        }
        let error = self.machine.lock().context().error.clone();
        self.persist_status(transition.to, error).await;
        match transition.to {
            AutomationState::Completed => info!("program completed"),
            _ => warn!(
                block = ?self.machine.lock().context().failed_block,
                "program failed"
            ),
        }
        self.emit_state(transition, None);
    }

    async fn fail_run(&self, block: &SmolStr, error: RuntimeError) {
        warn!(block = %block, "block failed: {error}");
        let now = self.services.clock.now_ms();
        let transition = self.machine.lock().fail(block, &error, now);
        if let Some(transition) = transition {
            self.finish_run(transition).await;
        }
    }
}

enum Step {
    Run {
        graph: Arc<ProgramGraph>,
        block_id: SmolStr,
        exec: ExecutionContext,
    },
    Finished(Transition),
    Exit,
}

async fn run_loop(inner: Arc<EngineInner>, cancel: CancellationToken) {
    let session = inner.session.lock().clone();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let step = {
            let mut machine = inner.machine.lock();
            if machine.state() != AutomationState::Running {
                Step::Exit
            } else if let Some(transition) = machine.finish_if_done() {
                Step::Finished(transition)
            } else {
                match (machine.graph().cloned(), machine.current_block().cloned()) {
                    (Some(graph), Some(block_id)) => Step::Run {
                        graph,
                        block_id,
                        exec: machine.context().exec.clone(),
                    },
                    _ => Step::Exit,
                }
            }
        };
        let (graph, block_id, mut exec) = match step {
            Step::Run {
                graph,
                block_id,
                exec,
            } => (graph, block_id, exec),
            Step::Finished(transition) => {
                inner.finish_run(transition).await;
                break;
            }
            Step::Exit => break,
        };
        let Some(block) = graph.block(&block_id) else {
            inner
                .fail_run(&block_id, RuntimeError::UnknownBlock(block_id.clone()))
                .await;
            break;
        };
        let Some(executor) = inner.executors.get(&block.block_type).cloned() else {
            inner
                .fail_run(&block_id, RuntimeError::NoExecutor(block.block_type.clone()))
                .await;
            break;
        };

        exec.step_count += 1;
        let max_steps = inner.settings.max_steps;
        if max_steps > 0 && exec.step_count > max_steps {
            inner.machine.lock().commit(exec);
            inner
                .fail_run(&block_id, RuntimeError::StepLimit(max_steps))
                .await;
            break;
        }
        exec.devices = inner.services.devices.snapshot();
        if let Some(session) = &session {
            match inner.services.sessions.load(session).await {
                Ok(Some(record)) => exec.resume_state.extend(record.resume_state),
                Ok(None) => {}
                Err(err) => warn!(session = %session, "session reload failed: {err}"),
            }
        }

        debug!(block = %block.id, block_type = %block.block_type, step = exec.step_count, "block start");
        inner.emit(AutomationEvent::BlockStart {
            session: session.clone(),
            block: block.id.clone(),
            block_type: block.block_type.clone(),
        });
        let saved = exec.resume_state.get(&block.id).cloned();
        let outcome = executor
            .execute(
                block,
                StepContext {
                    exec: &mut exec,
                    graph: &graph,
                    hardware: &inner.services.hardware,
                    converter: inner.services.converter.as_ref(),
                    clock: inner.services.clock.as_ref(),
                    cancel: &cancel,
                },
            )
            .await;
        let pausing = inner.machine.lock().state() == AutomationState::Paused;

        match outcome {
            BlockOutcome::Completed(result) => {
                let current = exec.resume_state.get(&block.id).cloned();
                if current != saved {
                    if let Some(session) = &session {
                        persist(
                            "resume state",
                            inner
                                .services
                                .sessions
                                .set_resume_state(session, &block.id, current),
                        )
                        .await;
                    }
                }
                let next = match result.next {
                    NextBlock::Follow => graph.default_next(&block.id).cloned(),
                    NextBlock::Goto(target) => Some(target),
                    NextBlock::Finish => None,
                };
                inner
                    .record_block_end(session.as_ref(), block, true, result.output, None)
                    .await;
                if let Some(target) = next.as_ref().filter(|target| !graph.contains(target)) {
                    inner.machine.lock().commit(exec);
                    inner
                        .fail_run(&block_id, RuntimeError::UnknownBlock(target.clone()))
                        .await;
                    break;
                }
                let finished = {
                    let mut machine = inner.machine.lock();
                    machine.commit(exec);
                    machine.advance(next)
                };
                if let Some(transition) = finished {
                    inner.finish_run(transition).await;
                    break;
                }
            }
            BlockOutcome::Paused(_) if !cancel.is_cancelled() => {
                let error = RuntimeError::BlockFailed {
                    block: block.id.clone(),
                    message: "suspended without a pause request".into(),
                };
                inner
                    .record_block_end(
                        session.as_ref(),
                        block,
                        false,
                        None,
                        Some(SmolStr::new(error.to_string())),
                    )
                    .await;
                inner.machine.lock().commit(exec);
                inner.fail_run(&block_id, error).await;
                break;
            }
            BlockOutcome::Paused(_) if !pausing => {
                // Stopped mid-block: the saved state must not reach the next run.
                debug!(block = %block.id, "block interrupted by stop");
                exec.resume_state.shift_remove(&block.id);
                inner.machine.lock().commit(exec);
                break;
            }
            BlockOutcome::Paused(state) => {
                debug!(block = %block.id, state = %state, "block suspended");
                exec.resume_state.insert(block.id.clone(), state.clone());
                if let Some(session) = &session {
                    persist(
                        "resume state",
                        inner
                            .services
                            .sessions
                            .set_resume_state(session, &block.id, Some(state.clone())),
                    )
                    .await;
                }
                inner
                    .record_block_end(
                        session.as_ref(),
                        block,
                        false,
                        Some(json!({ "suspended": state })),
                        None,
                    )
                    .await;
                inner.machine.lock().commit(exec);
                break;
            }
            BlockOutcome::Failed(error) if cancel.is_cancelled() => {
                // Interrupted by PAUSE/STOP; the block runs again on resume.
                debug!(block = %block.id, "block interrupted: {error}");
                inner.machine.lock().commit(exec);
                break;
            }
            BlockOutcome::Failed(error) => {
                inner
                    .record_block_end(
                        session.as_ref(),
                        block,
                        false,
                        None,
                        Some(SmolStr::new(error.to_string())),
                    )
                    .await;
                inner.machine.lock().commit(exec);
                inner.fail_run(&block_id, error).await;
                break;
            }
        }
    }
    inner.idle.send_replace(true);
}
