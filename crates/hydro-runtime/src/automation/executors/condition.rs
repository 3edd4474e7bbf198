//! IF and LOOP: comparisons against context variables with tolerance bands.

use indexmap::IndexMap;
use serde_json::{json, Value};
use smol_str::SmolStr;

use crate::automation::graph::ProgramGraph;
use crate::automation::types::Block;
use crate::error::RuntimeError;

use super::{
    checked_target, BlockExecutor, BlockOutcome, BlockOutput, ExecFuture, NextBlock, StepContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Operator {
    fn parse(text: &str) -> Option<Self> {
        Some(match text.trim().to_ascii_lowercase().as_str() {
            "==" | "=" | "eq" => Self::Eq,
            "!=" | "<>" | "ne" => Self::Ne,
            ">" | "gt" => Self::Gt,
            ">=" | "gte" | "ge" => Self::Ge,
            "<" | "lt" => Self::Lt,
            "<=" | "lte" | "le" => Self::Le,
            _ => return None,
        })
    }
}

/// `variable <operator> value`, with an optional tolerance band around
/// `value` of `[value - below, value + above]`.
///
/// The band is a dead zone: `>` and `>=` must clear its upper edge, `<` and
/// `<=` its lower edge, `==` holds anywhere inside it and `!=` outside it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Condition {
    variable: SmolStr,
    operator: Operator,
    value: Value,
    below: f64,
    above: f64,
}

impl Condition {
    /// `Ok(None)` when the block carries no `variable` parameter.
    pub(crate) fn from_block(block: &Block) -> Result<Option<Self>, RuntimeError> {
        let Some(variable) = block.str_param("variable") else {
            return Ok(None);
        };
        let operator_text = block.str_param("operator").unwrap_or("==");
        let operator = Operator::parse(operator_text).ok_or_else(|| {
            RuntimeError::params(&block.id, format!("unknown operator '{operator_text}'"))
        })?;
        let value = block
            .param("value")
            .cloned()
            .ok_or_else(|| RuntimeError::params(&block.id, "comparison needs a 'value'"))?;
        let (below, above) = tolerance(block)?;
        Ok(Some(Self {
            variable: SmolStr::new(variable),
            operator,
            value,
            below,
            above,
        }))
    }

    pub(crate) fn evaluate(
        &self,
        block: &Block,
        variables: &IndexMap<SmolStr, Value>,
    ) -> Result<bool, RuntimeError> {
        let actual = variables.get(&self.variable).ok_or_else(|| RuntimeError::BlockFailed {
            block: block.id.clone(),
            message: format!("variable '{}' is not set", self.variable).into(),
        })?;
        if let (Some(actual), Some(expected)) = (number(actual), number(&self.value)) {
            let low = expected - self.below;
            let high = expected + self.above;
            return Ok(match self.operator {
                Operator::Eq => (low..=high).contains(&actual),
                Operator::Ne => !(low..=high).contains(&actual),
                Operator::Gt => actual > high,
                Operator::Ge => actual >= high,
                Operator::Lt => actual < low,
                Operator::Le => actual <= low,
            });
        }
        match self.operator {
            Operator::Eq => Ok(*actual == self.value),
            Operator::Ne => Ok(*actual != self.value),
            _ => Err(RuntimeError::BlockFailed {
                block: block.id.clone(),
                message: format!(
                    "cannot order non-numeric values {actual} and {}",
                    self.value
                )
                .into(),
            }),
        }
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// `tolerance` with `tolerance_mode` (`symmetric`, `above`, `below`), or
/// explicit `tolerance_above` / `tolerance_below`.
fn tolerance(block: &Block) -> Result<(f64, f64), RuntimeError> {
    let check = |value: f64| {
        if value.is_finite() && value >= 0.0 {
            Ok(value)
        } else {
            Err(RuntimeError::params(&block.id, "tolerance must be a non-negative number"))
        }
    };
    let explicit_above = block.f64_param("tolerance_above").map(check).transpose()?;
    let explicit_below = block.f64_param("tolerance_below").map(check).transpose()?;
    if explicit_above.is_some() || explicit_below.is_some() {
        return Ok((explicit_below.unwrap_or(0.0), explicit_above.unwrap_or(0.0)));
    }
    let Some(band) = block.f64_param("tolerance").map(check).transpose()? else {
        return Ok((0.0, 0.0));
    };
    match block.str_param("tolerance_mode").unwrap_or("symmetric") {
        "symmetric" => Ok((band, band)),
        "above" => Ok((0.0, band)),
        "below" => Ok((band, 0.0)),
        other => Err(RuntimeError::params(
            &block.id,
            format!("unknown tolerance_mode '{other}'"),
        )),
    }
}

/// Branch target: `<param>` first, then the edge labelled `handle`.
fn branch_target(
    block: &Block,
    graph: &ProgramGraph,
    param: &str,
    handle: &str,
) -> Result<Option<SmolStr>, RuntimeError> {
    if let Some(target) = block.str_param(param) {
        return checked_target(block, graph, target).map(Some);
    }
    Ok(graph.handle_target(&block.id, handle).cloned())
}

/// Two-way branch on a comparison.
///
/// The taken branch is `true_target`/`false_target`, else the edge labelled
/// `true`/`false`, else the first unlabelled edge; with none the run ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct IfExecutor;

impl BlockExecutor for IfExecutor {
    fn execute<'a>(&'a self, block: &'a Block, ctx: StepContext<'a>) -> ExecFuture<'a> {
        Box::pin(async move {
            let decide = || -> Result<(bool, NextBlock), RuntimeError> {
                let condition = Condition::from_block(block)?.ok_or_else(|| {
                    RuntimeError::params(&block.id, "IF needs a 'variable' to compare")
                })?;
                let result = condition.evaluate(block, &ctx.exec.variables)?;
                let (param, handle) = if result {
                    ("true_target", "true")
                } else {
                    ("false_target", "false")
                };
                let next = branch_target(block, ctx.graph, param, handle)?
                    .or_else(|| ctx.graph.unlabelled_next(&block.id).cloned())
                    .map_or(NextBlock::Finish, NextBlock::Goto);
                Ok((result, next))
            };
            match decide() {
                Ok((result, next)) => BlockOutcome::Completed(BlockOutput {
                    next,
                    output: Some(json!({ "result": result })),
                }),
                Err(err) => BlockOutcome::Failed(err),
            }
        })
    }
}

/// Repeats its `body` branch until `count` iterations, `timeout_ms` of wall
/// time, or its comparison turns false; then takes the `exit` branch.
///
/// Resume state `{iteration, started_at_ms}` lives until the loop exits.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopExecutor;

impl BlockExecutor for LoopExecutor {
    fn execute<'a>(&'a self, block: &'a Block, ctx: StepContext<'a>) -> ExecFuture<'a> {
        Box::pin(async move {
            match run_loop(block, ctx) {
                Ok(outcome) => outcome,
                Err(err) => BlockOutcome::Failed(err),
            }
        })
    }
}

fn run_loop(block: &Block, ctx: StepContext<'_>) -> Result<BlockOutcome, RuntimeError> {
    let count = block
        .u64_param("count")
        .or_else(|| block.u64_param("max_iterations"));
    let timeout_ms = block.u64_param("timeout_ms").or_else(|| {
        block
            .f64_param("timeout_seconds")
            .filter(|value| value.is_finite() && *value >= 0.0)
            .map(|value| (value * 1_000.0).round() as u64)
    });
    let condition = Condition::from_block(block)?;
    if count.is_none() && timeout_ms.is_none() && condition.is_none() {
        return Err(RuntimeError::params(
            &block.id,
            "LOOP needs count, timeout_ms or a comparison",
        ));
    }

    let now = ctx.clock.now_ms();
    let state = ctx.exec.resume_state.get(&block.id);
    let iteration = state
        .and_then(|state| state.get("iteration"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let started_at_ms = state
        .and_then(|state| state.get("started_at_ms"))
        .and_then(Value::as_i64)
        .unwrap_or(now);

    let elapsed_ms = u64::try_from(now.saturating_sub(started_at_ms)).unwrap_or(0);
    let exit_reason = if count.is_some_and(|count| iteration >= count) {
        Some("count")
    } else if timeout_ms.is_some_and(|limit| elapsed_ms >= limit) {
        Some("timeout")
    } else if let Some(condition) = &condition {
        (!condition.evaluate(block, &ctx.exec.variables)?).then_some("condition")
    } else {
        None
    };

    if let Some(reason) = exit_reason {
        ctx.exec.resume_state.shift_remove(&block.id);
        let output = Some(json!({ "iterations": iteration, "reason": reason }));
        let next = branch_target(block, ctx.graph, "exit_target", "exit")?
            .or_else(|| ctx.graph.unlabelled_next(&block.id).cloned());
        return Ok(match next {
            Some(target) => BlockOutcome::goto(target, output),
            None => BlockOutcome::finish(output),
        });
    }

    let body = branch_target(block, ctx.graph, "body_target", "body")?
        .ok_or_else(|| RuntimeError::params(&block.id, "LOOP needs a body_target or a 'body' edge"))?;
    ctx.exec.resume_state.insert(
        block.id.clone(),
        json!({ "iteration": iteration + 1, "started_at_ms": started_at_ms }),
    );
    Ok(BlockOutcome::goto(
        body,
        Some(json!({ "iteration": iteration + 1 })),
    ))
}
