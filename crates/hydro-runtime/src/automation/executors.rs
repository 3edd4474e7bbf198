//! Block executors and the block-type registry.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use smol_str::SmolStr;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::command::TransportManager;
use crate::error::RuntimeError;

use super::devices::SensorConverter;
use super::graph::ProgramGraph;
use super::types::{Block, ExecutionContext};

mod actuator;
mod condition;
mod flow;
mod sensor;
mod wait;

pub use actuator::ActuatorSetExecutor;
pub use condition::{IfExecutor, LoopExecutor};
pub use flow::{EndExecutor, GotoExecutor, LabelExecutor, LogExecutor, StartExecutor};
pub use sensor::SensorReadExecutor;
pub use wait::WaitExecutor;

/// Boxed future returned by [`BlockExecutor::execute`].
pub type ExecFuture<'a> = Pin<Box<dyn Future<Output = BlockOutcome> + Send + 'a>>;

/// Where the run goes after a completed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextBlock {
    /// Follow the block's default outgoing edge.
    Follow,
    Goto(SmolStr),
    /// End the run normally.
    Finish,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockOutput {
    pub next: NextBlock,
    pub output: Option<Value>,
}

/// Result of one block execution.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    Completed(BlockOutput),
    Failed(RuntimeError),
    /// Cancelled after saving resumable state for this block.
    Paused(Value),
}

impl BlockOutcome {
    #[must_use]
    pub fn follow(output: Option<Value>) -> Self {
        Self::Completed(BlockOutput {
            next: NextBlock::Follow,
            output,
        })
    }

    #[must_use]
    pub fn goto(target: impl Into<SmolStr>, output: Option<Value>) -> Self {
        Self::Completed(BlockOutput {
            next: NextBlock::Goto(target.into()),
            output,
        })
    }

    #[must_use]
    pub fn finish(output: Option<Value>) -> Self {
        Self::Completed(BlockOutput {
            next: NextBlock::Finish,
            output,
        })
    }
}

/// What an executor may touch while running one block.
pub struct StepContext<'a> {
    pub exec: &'a mut ExecutionContext,
    pub graph: &'a ProgramGraph,
    pub hardware: &'a TransportManager,
    pub converter: &'a dyn SensorConverter,
    pub clock: &'a dyn Clock,
    /// Fired on PAUSE and STOP.
    pub cancel: &'a CancellationToken,
}

/// One block type's execution logic.
pub trait BlockExecutor: Send + Sync {
    fn execute<'a>(&'a self, block: &'a Block, ctx: StepContext<'a>) -> ExecFuture<'a>;
}

/// Block type tag to executor.
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<SmolStr, Arc<dyn BlockExecutor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("block_types", &self.block_types())
            .finish()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl ExecutorRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registry with every built-in block type.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register("START", Arc::new(StartExecutor));
        registry.register("END", Arc::new(EndExecutor));
        registry.register("LABEL", Arc::new(LabelExecutor));
        registry.register("GOTO", Arc::new(GotoExecutor));
        registry.register("LOG", Arc::new(LogExecutor));
        registry.register("WAIT", Arc::new(WaitExecutor));
        registry.register("IF", Arc::new(IfExecutor));
        registry.register("LOOP", Arc::new(LoopExecutor));
        registry.register("SENSOR_READ", Arc::new(SensorReadExecutor));
        registry.register("ACTUATOR_SET", Arc::new(ActuatorSetExecutor));
        registry
    }

    pub fn register(&mut self, block_type: &str, executor: Arc<dyn BlockExecutor>) {
        self.executors.insert(normalize_type(block_type), executor);
    }

    #[must_use]
    pub fn get(&self, block_type: &str) -> Option<&Arc<dyn BlockExecutor>> {
        self.executors.get(&normalize_type(block_type))
    }

    #[must_use]
    pub fn contains(&self, block_type: &str) -> bool {
        self.get(block_type).is_some()
    }

    /// Registered tags (stable sorted).
    #[must_use]
    pub fn block_types(&self) -> Vec<String> {
        let names: BTreeSet<_> = self.executors.keys().map(ToString::to_string).collect();
        names.into_iter().collect()
    }
}

fn normalize_type(block_type: &str) -> SmolStr {
    SmolStr::new(block_type.trim().to_ascii_uppercase().replace('-', "_"))
}

/// Sleep unless cancelled; on cancellation returns the time already slept.
pub(crate) async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), Duration> {
    let started = tokio::time::Instant::now();
    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        () = cancel.cancelled() => Err(started.elapsed()),
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Resolve a target block id and check it exists.
pub(crate) fn checked_target(
    block: &Block,
    graph: &ProgramGraph,
    target: &str,
) -> Result<SmolStr, RuntimeError> {
    if graph.contains(target) {
        Ok(SmolStr::new(target))
    } else {
        Err(RuntimeError::params(
            &block.id,
            format!("target block '{target}' does not exist"),
        ))
    }
}
