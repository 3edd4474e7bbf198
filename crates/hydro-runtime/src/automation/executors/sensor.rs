//! SENSOR_READ: sample a sensor into a context variable.

use std::time::Duration;

use serde_json::json;
use smol_str::SmolStr;
use tracing::warn;

use crate::automation::devices::reading_value;
use crate::automation::types::Block;
use crate::error::RuntimeError;
use crate::io::Response;

use super::{BlockExecutor, BlockOutcome, ExecFuture, StepContext};

/// Reads `device`, converts the raw value and stores it in `variable`
/// (defaults to the device id).
///
/// `retries` re-sends the read after a timeout; device-reported errors are
/// never retried.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorReadExecutor;

impl BlockExecutor for SensorReadExecutor {
    fn execute<'a>(&'a self, block: &'a Block, ctx: StepContext<'a>) -> ExecFuture<'a> {
        Box::pin(async move {
            match read_sensor(block, ctx).await {
                Ok(outcome) => outcome,
                Err(err) => BlockOutcome::Failed(err),
            }
        })
    }
}

async fn read_sensor(block: &Block, ctx: StepContext<'_>) -> Result<BlockOutcome, RuntimeError> {
    let device_id = block
        .str_param("device")
        .ok_or_else(|| RuntimeError::params(&block.id, "SENSOR_READ needs a 'device'"))?;
    let device = ctx
        .exec
        .device(device_id)
        .cloned()
        .ok_or_else(|| RuntimeError::UnknownDevice(SmolStr::new(device_id)))?;
    let variable = SmolStr::new(block.str_param("variable").unwrap_or(device_id));
    let retries = block.u64_param("retries").unwrap_or(0);
    let timeout = block
        .u64_param("timeout_ms")
        .map_or(ctx.hardware.settings().command_timeout, Duration::from_millis);
    let packet = device.read_packet()?;

    let mut attempt = 0;
    let response: Response = loop {
        let request =
            ctx.hardware
                .enqueue_command_with_timeout(&device.controller, packet.clone(), timeout);
        // Dropping the request leaves the queued command to its own timeout.
        let result = tokio::select! {
            result = request => result,
            () = ctx.cancel.cancelled() => return Ok(BlockOutcome::Failed(RuntimeError::Cancelled)),
        };
        match result {
            Ok(response) => break response,
            Err(err) if err.is_timeout() && attempt < retries => {
                attempt += 1;
                warn!(block = %block.id, device = %device.id, attempt, retries, "sensor read timed out, retrying");
            }
            Err(err) => return Err(err.into()),
        }
    };

    let raw = response
        .data
        .as_ref()
        .and_then(reading_value)
        .ok_or_else(|| RuntimeError::BlockFailed {
            block: block.id.clone(),
            message: format!("device '{}' returned no numeric reading", device.id).into(),
        })?;
    let value = ctx.converter.convert(&device, raw)?;
    ctx.exec.variables.insert(variable.clone(), json!(value));
    Ok(BlockOutcome::follow(Some(json!({
        "device": device.id,
        "variable": variable,
        "raw": raw,
        "value": value,
        "unit": device.unit,
        "attempts": attempt + 1,
    }))))
}
