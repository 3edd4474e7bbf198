//! START, END, LABEL, GOTO and LOG.

use indexmap::IndexMap;
use serde_json::{json, Value};
use smol_str::SmolStr;
use tracing::{debug, error, info, warn};

use crate::automation::types::Block;
use crate::error::RuntimeError;

use super::{checked_target, BlockExecutor, BlockOutcome, ExecFuture, StepContext};

#[derive(Debug, Clone, Copy, Default)]
pub struct StartExecutor;

impl BlockExecutor for StartExecutor {
    fn execute<'a>(&'a self, _block: &'a Block, _ctx: StepContext<'a>) -> ExecFuture<'a> {
        Box::pin(async { BlockOutcome::follow(None) })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EndExecutor;

impl BlockExecutor for EndExecutor {
    fn execute<'a>(&'a self, _block: &'a Block, _ctx: StepContext<'a>) -> ExecFuture<'a> {
        Box::pin(async { BlockOutcome::finish(None) })
    }
}

/// Jump anchor; passes straight through.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelExecutor;

impl BlockExecutor for LabelExecutor {
    fn execute<'a>(&'a self, _block: &'a Block, _ctx: StepContext<'a>) -> ExecFuture<'a> {
        Box::pin(async { BlockOutcome::follow(None) })
    }
}

/// Jump to `target` (block id) or `label` (LABEL name).
#[derive(Debug, Clone, Copy, Default)]
pub struct GotoExecutor;

impl BlockExecutor for GotoExecutor {
    fn execute<'a>(&'a self, block: &'a Block, ctx: StepContext<'a>) -> ExecFuture<'a> {
        Box::pin(async move {
            let target = if let Some(target) = block.str_param("target") {
                checked_target(block, ctx.graph, target)
            } else if let Some(label) = block.str_param("label") {
                ctx.graph.label(label).cloned().ok_or_else(|| {
                    RuntimeError::params(&block.id, format!("no LABEL named '{label}'"))
                })
            } else {
                Err(RuntimeError::params(&block.id, "GOTO needs 'target' or 'label'"))
            };
            match target {
                Ok(target) => BlockOutcome::goto(target.clone(), Some(json!({ "target": target }))),
                Err(err) => BlockOutcome::Failed(err),
            }
        })
    }
}

/// Emit `message` (with `{variable}` interpolation) at `level`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogExecutor;

impl BlockExecutor for LogExecutor {
    fn execute<'a>(&'a self, block: &'a Block, ctx: StepContext<'a>) -> ExecFuture<'a> {
        Box::pin(async move {
            let template = block.str_param("message").unwrap_or_default();
            let message = interpolate(template, &ctx.exec.variables);
            let level = block.str_param("level").unwrap_or("info");
            match level.to_ascii_lowercase().as_str() {
                "debug" => debug!(block = %block.id, "{message}"),
                "warn" | "warning" => warn!(block = %block.id, "{message}"),
                "error" => error!(block = %block.id, "{message}"),
                _ => info!(block = %block.id, "{message}"),
            }
            BlockOutcome::follow(Some(json!({ "message": message, "level": level })))
        })
    }
}

/// Replace `{name}` with the variable's value; unknown names are left as written.
pub(crate) fn interpolate(template: &str, variables: &IndexMap<SmolStr, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = after[..close].trim();
        match variables.get(name) {
            Some(Value::String(text)) => out.push_str(text),
            Some(value) => out.push_str(&value.to_string()),
            None => out.push_str(&rest[open..=open + 1 + close]),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}
