//! Runtime configuration loading (`hydro.toml`).

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use smol_str::SmolStr;

use crate::automation::DeviceConfig;
use crate::error::RuntimeError;
use crate::io::{ControllerId, TransportRegistry};

pub const DEFAULT_CONFIG_FILE: &str = "hydro.toml";

const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_MAX_STEPS: u64 = 100_000;

#[derive(Debug, Clone, PartialEq)]
pub struct HydroConfig {
    pub runtime: RuntimeSettings,
    pub controllers: IndexMap<ControllerId, ControllerConfig>,
    pub devices: IndexMap<SmolStr, DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub log_level: SmolStr,
    pub command_timeout: Duration,
    pub ping_timeout: Duration,
    /// 0 disables the step guard.
    pub max_steps: u64,
    pub require_id_echo: bool,
    pub program_dir: PathBuf,
    pub session_dir: PathBuf,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            log_level: SmolStr::new_inline("info"),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
            max_steps: DEFAULT_MAX_STEPS,
            require_id_echo: false,
            program_dir: PathBuf::from("programs"),
            session_dir: PathBuf::from("sessions"),
        }
    }
}

/// Stored connection settings for one controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub id: ControllerId,
    /// Connection type name as configured (`serial`, `network`, aliases allowed).
    pub connection: SmolStr,
    pub params: toml::Value,
}

impl ControllerConfig {
    #[must_use]
    pub fn new(id: impl Into<SmolStr>, connection: impl Into<SmolStr>) -> Self {
        Self {
            id: id.into(),
            connection: connection.into(),
            params: toml::Value::Table(toml::map::Map::new()),
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: toml::Value) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    #[serde(default)]
    runtime: RuntimeToml,
    #[serde(default)]
    controllers: Vec<ControllerToml>,
    #[serde(default)]
    devices: Vec<DeviceConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeToml {
    log_level: Option<String>,
    command_timeout_ms: Option<u64>,
    ping_timeout_ms: Option<u64>,
    max_steps: Option<u64>,
    require_id_echo: Option<bool>,
    program_dir: Option<PathBuf>,
    session_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ControllerToml {
    id: String,
    connection: String,
    params: Option<toml::Value>,
}

impl HydroConfig {
    /// Load, resolve relative directories against the file location, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            RuntimeError::InvalidConfig(format!("read {}: {err}", path.display()).into())
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if let Some(base) = path.parent() {
            config.runtime.program_dir = base.join(&config.runtime.program_dir);
            config.runtime.session_dir = base.join(&config.runtime.session_dir);
        }
        config.validate(&TransportRegistry::default_registry())?;
        Ok(config)
    }

    /// Parse without connection-parameter validation.
    pub fn from_toml_str(text: &str) -> Result<Self, RuntimeError> {
        let raw: ConfigToml = toml::from_str(text)
            .map_err(|err| RuntimeError::InvalidConfig(format!("{err}").into()))?;
        let runtime = RuntimeSettings::from_toml(raw.runtime)?;

        let mut controllers = IndexMap::new();
        for entry in raw.controllers {
            let id = SmolStr::new(entry.id.trim());
            if id.is_empty() {
                return Err(RuntimeError::InvalidConfig(
                    "controllers.id must not be empty".into(),
                ));
            }
            let controller = ControllerConfig {
                id: id.clone(),
                connection: SmolStr::new(entry.connection.trim()),
                params: entry
                    .params
                    .unwrap_or_else(|| toml::Value::Table(toml::map::Map::new())),
            };
            if controllers.insert(id.clone(), controller).is_some() {
                return Err(RuntimeError::InvalidConfig(
                    format!("duplicate controller '{id}'").into(),
                ));
            }
        }

        let mut devices = IndexMap::new();
        for device in raw.devices {
            if !controllers.contains_key(&device.controller) {
                return Err(RuntimeError::InvalidConfig(
                    format!(
                        "device '{}' references unknown controller '{}'",
                        device.id, device.controller
                    )
                    .into(),
                ));
            }
            let id = device.id.clone();
            if devices.insert(id.clone(), device).is_some() {
                return Err(RuntimeError::InvalidConfig(
                    format!("duplicate device '{id}'").into(),
                ));
            }
        }

        Ok(Self {
            runtime,
            controllers,
            devices,
        })
    }

    /// Check every controller's connection type and parameters.
    pub fn validate(&self, registry: &TransportRegistry) -> Result<(), RuntimeError> {
        for controller in self.controllers.values() {
            registry
                .validate(&controller.connection, &controller.params)
                .map_err(|err| {
                    RuntimeError::InvalidConfig(
                        format!("controller '{}': {err}", controller.id).into(),
                    )
                })?;
        }
        Ok(())
    }
}

impl RuntimeSettings {
    fn from_toml(raw: RuntimeToml) -> Result<Self, RuntimeError> {
        let defaults = Self::default();
        let command_timeout_ms = raw.command_timeout_ms.unwrap_or(DEFAULT_COMMAND_TIMEOUT_MS);
        let ping_timeout_ms = raw.ping_timeout_ms.unwrap_or(DEFAULT_PING_TIMEOUT_MS);
        if command_timeout_ms == 0 || ping_timeout_ms == 0 {
            return Err(RuntimeError::InvalidConfig(
                "runtime timeouts must be greater than zero".into(),
            ));
        }
        Ok(Self {
            log_level: raw
                .log_level
                .map_or(defaults.log_level, |level| SmolStr::new(level.trim())),
            command_timeout: Duration::from_millis(command_timeout_ms),
            ping_timeout: Duration::from_millis(ping_timeout_ms),
            max_steps: raw.max_steps.unwrap_or(DEFAULT_MAX_STEPS),
            require_id_echo: raw.require_id_echo.unwrap_or(false),
            program_dir: raw.program_dir.unwrap_or(defaults.program_dir),
            session_dir: raw.session_dir.unwrap_or(defaults.session_dir),
        })
    }
}
