//! Block-graph automation: program model, lifecycle machine, executors and
//! the engine that runs them against the hardware.

#![allow(missing_docs)]

use std::future::Future;
use std::pin::Pin;

pub mod devices;
pub mod engine;
pub mod events;
pub mod executors;
pub mod graph;
pub mod machine;
pub mod session;
pub mod types;

/// Boxed future returned by program sources and session stores.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use devices::{
    reading_value, DeviceConfig, DeviceDirectory, DeviceKind, IdentityConverter, SensorConverter,
    StaticDevices,
};
pub use engine::{AutomationEngine, AutomationServices, AutomationSnapshot, EngineSettings};
pub use events::AutomationEvent;
pub use executors::{
    BlockExecutor, BlockOutcome, BlockOutput, ExecFuture, ExecutorRegistry, NextBlock,
    StepContext,
};
pub use graph::{DirectoryProgramSource, MemoryProgramSource, ProgramGraph, ProgramSource};
pub use machine::{AutomationContext, AutomationMachine, AutomationState, ControlEvent, Transition};
pub use session::{
    FileSessionStore, MemorySessionStore, SessionLogEntry, SessionRecord, SessionStore,
};
pub use types::{
    ActiveResource, Block, Edge, ExecutionContext, ExecutionError, ProgramDefinition,
    VariableDefinition,
};
