//! Program and execution-context data types.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;

use super::devices::DeviceConfig;

/// One node of a program graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: SmolStr,
    #[serde(rename = "type")]
    pub block_type: SmolStr,
    #[serde(default)]
    pub params: Value,
}

impl Block {
    #[must_use]
    pub fn new(id: impl Into<SmolStr>, block_type: impl Into<SmolStr>, params: Value) -> Self {
        Self {
            id: id.into(),
            block_type: block_type.into(),
            params,
        }
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key).filter(|value| !value.is_null())
    }

    #[must_use]
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn f64_param(&self, key: &str) -> Option<f64> {
        self.param(key).and_then(|value| match value {
            Value::String(text) => text.trim().parse().ok(),
            other => other.as_f64(),
        })
    }

    #[must_use]
    pub fn u64_param(&self, key: &str) -> Option<u64> {
        self.f64_param(key)
            .filter(|value| value.is_finite() && *value >= 0.0)
            // Saturating float-to-int conversion.
            .map(|value| value.round() as u64)
    }

    #[must_use]
    pub fn bool_param(&self, key: &str) -> Option<bool> {
        self.param(key).and_then(Value::as_bool)
    }
}

/// Directed edge; `handle` labels branch outputs (`true`/`false`, `body`/`exit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: SmolStr,
    pub target: SmolStr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<SmolStr>,
}

impl Edge {
    #[must_use]
    pub fn new(source: impl Into<SmolStr>, target: impl Into<SmolStr>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            handle: None,
        }
    }

    #[must_use]
    pub fn labelled(mut self, handle: impl Into<SmolStr>) -> Self {
        self.handle = Some(handle.into());
        self
    }
}

/// Read-only metadata for a program variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: SmolStr,
    #[serde(rename = "type", default)]
    pub value_type: Option<SmolStr>,
    #[serde(default)]
    pub unit: Option<SmolStr>,
    #[serde(default)]
    pub scope: Option<SmolStr>,
    #[serde(default)]
    pub initial: Option<Value>,
}

/// Stored program definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramDefinition {
    pub id: SmolStr,
    #[serde(default)]
    pub name: Option<SmolStr>,
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
}

impl ProgramDefinition {
    #[must_use]
    pub fn new(id: impl Into<SmolStr>, blocks: Vec<Block>, edges: Vec<Edge>) -> Self {
        Self {
            id: id.into(),
            name: None,
            blocks,
            edges,
            variables: Vec::new(),
        }
    }
}

/// A device the run has changed, remembered for safety rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveResource {
    pub device: SmolStr,
    /// Logical state before the run first touched the device.
    pub previous_state: bool,
    pub revert_on_stop: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub block: SmolStr,
    pub message: SmolStr,
    pub at_ms: i64,
}

/// Mutable state threaded through every block of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub variables: IndexMap<SmolStr, Value>,
    pub variable_definitions: IndexMap<SmolStr, VariableDefinition>,
    /// Refreshed by the engine before each block.
    #[serde(skip)]
    pub devices: IndexMap<SmolStr, DeviceConfig>,
    pub step_count: u64,
    pub start_time_ms: Option<i64>,
    pub errors: Vec<ExecutionError>,
    /// Opaque per-block state keyed by block id.
    pub resume_state: IndexMap<SmolStr, Value>,
    pub active_resources: IndexMap<SmolStr, ActiveResource>,
}

impl ExecutionContext {
    /// Fresh context seeded with the program's variable defaults.
    #[must_use]
    pub fn for_program(definitions: &[VariableDefinition]) -> Self {
        let mut context = Self::default();
        for definition in definitions {
            context
                .variable_definitions
                .insert(definition.name.clone(), definition.clone());
            if let Some(initial) = &definition.initial {
                context
                    .variables
                    .insert(definition.name.clone(), initial.clone());
            }
        }
        context
    }

    /// Reset run-scoped data, keeping definitions and resume state.
    pub fn reset_run(&mut self) {
        self.variables.clear();
        for (name, definition) in &self.variable_definitions {
            if let Some(initial) = &definition.initial {
                self.variables.insert(name.clone(), initial.clone());
            }
        }
        self.step_count = 0;
        self.start_time_ms = None;
        self.errors.clear();
    }

    #[must_use]
    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.get(id)
    }

    /// Record that `device` now sits in `state`; drops the entry once it is back
    /// where the run found it.
    pub fn track_actuator(&mut self, device: &DeviceConfig, state: bool, revert_on_stop: bool) {
        let entry = self
            .active_resources
            .entry(device.id.clone())
            .or_insert_with(|| ActiveResource {
                device: device.id.clone(),
                previous_state: device.state,
                revert_on_stop,
            });
        entry.revert_on_stop = revert_on_stop;
        if entry.previous_state == state {
            self.active_resources.shift_remove(&device.id);
        }
    }
}
