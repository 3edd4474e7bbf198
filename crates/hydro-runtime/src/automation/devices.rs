//! Device snapshot: how a sensor or actuator maps onto controller pins.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;

use crate::error::RuntimeError;
use crate::io::{ControllerId, Packet};

const DEFAULT_WRITE_COMMAND: &str = "digital_write";
const DEFAULT_READ_COMMAND: &str = "analog_read";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Actuator,
    Sensor,
}

/// One configured device (`[[devices]]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub id: SmolStr,
    pub controller: ControllerId,
    pub kind: DeviceKind,
    #[serde(default)]
    pub port: Option<u8>,
    #[serde(default)]
    pub gpio: Option<u8>,
    /// Relay boards that switch on a low level.
    #[serde(default)]
    pub active_low: bool,
    /// Calibrated pump flow used to turn a dose volume into an on-time.
    #[serde(default)]
    pub flow_rate_ml_per_s: Option<f64>,
    #[serde(default)]
    pub unit: Option<SmolStr>,
    #[serde(default)]
    pub sensor_type: Option<SmolStr>,
    #[serde(default)]
    pub read_command: Option<SmolStr>,
    #[serde(default)]
    pub write_command: Option<SmolStr>,
    /// Logical state before any automation touched the device.
    #[serde(default)]
    pub state: bool,
}

impl DeviceConfig {
    #[must_use]
    pub fn actuator(id: impl Into<SmolStr>, controller: impl Into<SmolStr>, port: u8, gpio: u8) -> Self {
        Self {
            id: id.into(),
            controller: controller.into(),
            kind: DeviceKind::Actuator,
            port: Some(port),
            gpio: Some(gpio),
            active_low: false,
            flow_rate_ml_per_s: None,
            unit: None,
            sensor_type: None,
            read_command: None,
            write_command: None,
            state: false,
        }
    }

    #[must_use]
    pub fn sensor(id: impl Into<SmolStr>, controller: impl Into<SmolStr>, port: u8, gpio: u8) -> Self {
        Self {
            kind: DeviceKind::Sensor,
            ..Self::actuator(id, controller, port, gpio)
        }
    }

    #[must_use]
    pub fn with_flow_rate(mut self, ml_per_s: f64) -> Self {
        self.flow_rate_ml_per_s = Some(ml_per_s);
        self
    }

    fn pin(&self) -> Result<(u8, u8), RuntimeError> {
        match (self.port, self.gpio) {
            (Some(port), Some(gpio)) => Ok((port, gpio)),
            _ => Err(RuntimeError::InvalidConfig(
                format!("device '{}' has no port/gpio assignment", self.id).into(),
            )),
        }
    }

    /// Command that drives the actuator to the logical `on` state.
    pub fn write_packet(&self, on: bool) -> Result<Packet, RuntimeError> {
        if self.kind != DeviceKind::Actuator {
            return Err(RuntimeError::InvalidConfig(
                format!("device '{}' is not an actuator", self.id).into(),
            ));
        }
        let (port, gpio) = self.pin()?;
        let command = self.write_command.as_deref().unwrap_or(DEFAULT_WRITE_COMMAND);
        Ok(Packet::new(command)
            .pin(port, gpio)
            .with("state", on != self.active_low))
    }

    /// Command that samples the sensor.
    pub fn read_packet(&self) -> Result<Packet, RuntimeError> {
        let (port, gpio) = self.pin()?;
        let command = self.read_command.as_deref().unwrap_or(DEFAULT_READ_COMMAND);
        let mut packet = Packet::new(command).pin(port, gpio);
        if let Some(sensor_type) = &self.sensor_type {
            packet = packet.with("type", sensor_type.as_str());
        }
        Ok(packet)
    }
}

/// Source of the device snapshot refreshed before every block.
pub trait DeviceDirectory: Send + Sync {
    fn snapshot(&self) -> IndexMap<SmolStr, DeviceConfig>;
}

/// Fixed device list (from configuration).
#[derive(Debug, Clone, Default)]
pub struct StaticDevices {
    devices: IndexMap<SmolStr, DeviceConfig>,
}

impl StaticDevices {
    #[must_use]
    pub fn new(devices: IndexMap<SmolStr, DeviceConfig>) -> Self {
        Self { devices }
    }

    #[must_use]
    pub fn with(mut self, device: DeviceConfig) -> Self {
        self.devices.insert(device.id.clone(), device);
        self
    }
}

impl DeviceDirectory for StaticDevices {
    fn snapshot(&self) -> IndexMap<SmolStr, DeviceConfig> {
        self.devices.clone()
    }
}

/// Unit conversion for raw sensor readings (calibration lives elsewhere).
pub trait SensorConverter: Send + Sync {
    fn convert(&self, device: &DeviceConfig, raw: f64) -> Result<f64, RuntimeError>;
}

/// Passes raw readings through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityConverter;

impl SensorConverter for IdentityConverter {
    fn convert(&self, _device: &DeviceConfig, raw: f64) -> Result<f64, RuntimeError> {
        Ok(raw)
    }
}

/// Pull a numeric reading out of a response payload.
///
/// Firmware answers either with a bare number or an object carrying `value`.
#[must_use]
pub fn reading_value(data: &Value) -> Option<f64> {
    match data {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        Value::Object(object) => object.get("value").and_then(reading_value),
        _ => None,
    }
}
