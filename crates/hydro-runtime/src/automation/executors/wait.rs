//! WAIT: a resumable sleep.

use std::time::Duration;

use serde_json::json;

use crate::automation::types::Block;
use crate::error::RuntimeError;

use super::{duration_ms, sleep_or_cancel, BlockExecutor, BlockOutcome, ExecFuture, StepContext};

/// Sleeps `duration_ms` (or `seconds`/`minutes`).
///
/// Cancellation pauses with `{"remaining_ms"}`; the next run of the block
/// sleeps only the remainder.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitExecutor;

impl BlockExecutor for WaitExecutor {
    fn execute<'a>(&'a self, block: &'a Block, ctx: StepContext<'a>) -> ExecFuture<'a> {
        Box::pin(async move {
            let resumed = ctx
                .exec
                .resume_state
                .get(&block.id)
                .and_then(|state| state.get("remaining_ms"))
                .and_then(serde_json::Value::as_u64);
            let total_ms = match resumed.or_else(|| configured_ms(block)) {
                Some(ms) => ms,
                None => {
                    return BlockOutcome::Failed(RuntimeError::params(
                        &block.id,
                        "WAIT needs duration_ms, seconds or minutes",
                    ))
                }
            };
            match sleep_or_cancel(Duration::from_millis(total_ms), ctx.cancel).await {
                Ok(()) => {
                    ctx.exec.resume_state.shift_remove(&block.id);
                    BlockOutcome::follow(Some(json!({
                        "waited_ms": total_ms,
                        "resumed": resumed.is_some(),
                    })))
                }
                Err(elapsed) => BlockOutcome::Paused(json!({
                    "remaining_ms": total_ms.saturating_sub(duration_ms(elapsed)),
                })),
            }
        })
    }
}

fn configured_ms(block: &Block) -> Option<u64> {
    if let Some(ms) = block.u64_param("duration_ms") {
        return Some(ms);
    }
    let scaled = |key: &str, factor: f64| {
        block
            .f64_param(key)
            .filter(|value| value.is_finite() && *value >= 0.0)
            .map(|value| (value * factor).round() as u64)
    };
    scaled("seconds", 1_000.0).or_else(|| scaled("minutes", 60_000.0))
}
