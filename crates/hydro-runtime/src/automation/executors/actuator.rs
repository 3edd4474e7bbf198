//! ACTUATOR_SET: switch, pulse or dose an actuator.

use std::time::Duration;

use serde_json::json;
use smol_str::SmolStr;
use tracing::{info, warn};

use crate::automation::devices::DeviceConfig;
use crate::automation::types::{ActiveResource, Block, ExecutionContext};
use crate::command::TransportManager;
use crate::error::RuntimeError;

use super::{sleep_or_cancel, BlockExecutor, BlockOutcome, ExecFuture, StepContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    On,
    Off,
    PulseOn,
    PulseOff,
    Dose,
}

impl Action {
    fn parse(text: &str) -> Option<Self> {
        Some(match text.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "ON" => Self::On,
            "OFF" => Self::Off,
            "PULSE_ON" => Self::PulseOn,
            "PULSE_OFF" => Self::PulseOff,
            "DOSE" => Self::Dose,
            _ => return None,
        })
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
            Self::PulseOn => "PULSE_ON",
            Self::PulseOff => "PULSE_OFF",
            Self::Dose => "DOSE",
        }
    }
}

/// Drives `device` according to `action`.
///
/// ON/OFF leave the device set and record it for rollback on STOP or error.
/// PULSE_ON/PULSE_OFF hold the level for `duration_ms`; DOSE holds it on for
/// `volume_ml / flow_rate_ml_per_s` seconds. A cancelled pulse or dose sends
/// the inverse command before reporting the cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActuatorSetExecutor;

impl BlockExecutor for ActuatorSetExecutor {
    fn execute<'a>(&'a self, block: &'a Block, ctx: StepContext<'a>) -> ExecFuture<'a> {
        Box::pin(async move {
            match set_actuator(block, ctx).await {
                Ok(outcome) => outcome,
                Err(err) => BlockOutcome::Failed(err),
            }
        })
    }
}

async fn set_actuator(block: &Block, ctx: StepContext<'_>) -> Result<BlockOutcome, RuntimeError> {
    let device_id = block
        .str_param("device")
        .ok_or_else(|| RuntimeError::params(&block.id, "ACTUATOR_SET needs a 'device'"))?;
    let device = ctx
        .exec
        .device(device_id)
        .cloned()
        .ok_or_else(|| RuntimeError::UnknownDevice(SmolStr::new(device_id)))?;
    let action_text = block
        .str_param("action")
        .ok_or_else(|| RuntimeError::params(&block.id, "ACTUATOR_SET needs an 'action'"))?;
    let action = Action::parse(action_text)
        .ok_or_else(|| RuntimeError::params(&block.id, format!("unknown action '{action_text}'")))?;
    let revert_on_stop = block.bool_param("revert_on_stop").unwrap_or(true);

    let (level, hold_ms) = match action {
        Action::On => (true, None),
        Action::Off => (false, None),
        Action::PulseOn => (true, Some(pulse_ms(block)?)),
        Action::PulseOff => (false, Some(pulse_ms(block)?)),
        Action::Dose => (true, Some(dose_ms(block, &device)?)),
    };

    write(ctx.hardware, &device, level).await?;
    let Some(hold_ms) = hold_ms else {
        ctx.exec.track_actuator(&device, level, revert_on_stop);
        return Ok(BlockOutcome::follow(Some(json!({
            "device": device.id,
            "action": action.as_str(),
            "state": level,
        }))));
    };

    // Tracked for the hold so a failed revert is retried by the rollback.
    let tracked_before = ctx.exec.active_resources.get(&device.id).cloned();
    ctx.exec.track_actuator(&device, level, true);
    let held = if ctx.cancel.is_cancelled() {
        Err(Duration::ZERO)
    } else {
        sleep_or_cancel(Duration::from_millis(hold_ms), ctx.cancel).await
    };
    if let Err(elapsed) = held {
        info!(block = %block.id, device = %device.id, elapsed_ms = ?elapsed, "pulse cancelled, reverting");
        match write(ctx.hardware, &device, !level).await {
            Ok(()) => restore_tracking(ctx.exec, &device, tracked_before),
            Err(err) => {
                warn!(block = %block.id, device = %device.id, "revert after cancel failed: {err}");
            }
        }
        return Ok(BlockOutcome::Failed(RuntimeError::Cancelled));
    }
    write(ctx.hardware, &device, !level).await?;
    restore_tracking(ctx.exec, &device, tracked_before);
    Ok(BlockOutcome::follow(Some(json!({
        "device": device.id,
        "action": action.as_str(),
        "duration_ms": hold_ms,
    }))))
}

fn restore_tracking(
    exec: &mut ExecutionContext,
    device: &DeviceConfig,
    before: Option<ActiveResource>,
) {
    match before {
        Some(resource) => {
            exec.active_resources.insert(device.id.clone(), resource);
        }
        None => {
            exec.active_resources.shift_remove(&device.id);
        }
    }
}

async fn write(
    hardware: &TransportManager,
    device: &DeviceConfig,
    on: bool,
) -> Result<(), RuntimeError> {
    let packet = device.write_packet(on)?;
    hardware.enqueue_command(&device.controller, packet).await?;
    Ok(())
}

fn pulse_ms(block: &Block) -> Result<u64, RuntimeError> {
    block
        .u64_param("duration_ms")
        .or_else(|| {
            block
                .f64_param("seconds")
                .filter(|value| value.is_finite() && *value >= 0.0)
                .map(|value| (value * 1_000.0).round() as u64)
        })
        .ok_or_else(|| RuntimeError::params(&block.id, "pulse needs duration_ms or seconds"))
}

fn dose_ms(block: &Block, device: &DeviceConfig) -> Result<u64, RuntimeError> {
    let volume = block
        .f64_param("volume_ml")
        .filter(|volume| volume.is_finite() && *volume > 0.0)
        .ok_or_else(|| RuntimeError::params(&block.id, "DOSE needs a positive volume_ml"))?;
    let flow = block
        .f64_param("flow_rate_ml_per_s")
        .or(device.flow_rate_ml_per_s)
        .filter(|flow| flow.is_finite() && *flow > 0.0)
        .ok_or_else(|| {
            RuntimeError::params(
                &block.id,
                format!("device '{}' has no calibrated flow rate", device.id),
            )
        })?;
    Ok((volume / flow * 1_000.0).round() as u64)
}
