//! Connection-type registry used to open controller links.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use smol_str::SmolStr;

use crate::error::{CommandError, RuntimeError};

use super::{
    ConnectRequest, LoopbackTransport, NetworkConfig, NetworkTransport, SerialConfig,
    SerialTransport, Transport, TransportFuture,
};

/// Opens a link for one controller.
pub type Connector = Arc<
    dyn Fn(ConnectRequest) -> TransportFuture<'static, Result<Box<dyn Transport>, CommandError>>
        + Send
        + Sync,
>;

type ParamsValidate = fn(&toml::Value) -> Result<(), RuntimeError>;

#[derive(Clone)]
struct TransportRegistryEntry {
    canonical: SmolStr,
    connect: Connector,
    validate: ParamsValidate,
}

#[derive(Clone)]
pub struct TransportRegistry {
    entries: HashMap<SmolStr, TransportRegistryEntry>,
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("kinds", &self.canonical_names())
            .finish()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::default_registry()
    }
}

impl TransportRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn default_registry() -> Self {
        let mut registry = Self::empty();
        registry.register("serial", Arc::new(connect_serial), SerialConfig::validate_params);
        registry.register_alias("usb", "serial");

        registry.register(
            "network",
            Arc::new(connect_network),
            NetworkConfig::validate_params,
        );
        registry.register_alias("udp", "network");
        registry.register_alias("wifi", "network");

        registry.register("loopback", Arc::new(connect_loopback), accept_any_params);
        registry.register_alias("simulated", "loopback");
        registry.register_alias("sim", "loopback");
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<SmolStr>,
        connect: Connector,
        validate: ParamsValidate,
    ) {
        let canonical = normalize_name(&name.into());
        let entry = TransportRegistryEntry {
            canonical: canonical.clone(),
            connect,
            validate,
        };
        self.entries.insert(canonical, entry);
    }

    pub fn register_alias(&mut self, alias: impl Into<SmolStr>, target: &str) {
        let alias = normalize_name(&alias.into());
        if let Some(entry) = self.entries.get(&normalize_name(target)).cloned() {
            self.entries.insert(alias, entry);
        }
    }

    /// Resolve a connection name (or alias) to its canonical kind.
    #[must_use]
    pub fn canonical(&self, connection: &str) -> Option<SmolStr> {
        self.entries
            .get(&normalize_name(connection))
            .map(|entry| entry.canonical.clone())
    }

    pub fn validate(&self, connection: &str, params: &toml::Value) -> Result<(), RuntimeError> {
        let entry = self.entries.get(&normalize_name(connection)).ok_or_else(|| {
            RuntimeError::InvalidConfig(format!("unsupported connection '{connection}'").into())
        })?;
        (entry.validate)(params)
    }

    /// Open a link using the connector registered for the controller's connection type.
    pub async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn Transport>, CommandError> {
        let connection = request.controller.connection.clone();
        let entry = self
            .entries
            .get(&normalize_name(&connection))
            .ok_or(CommandError::UnsupportedConnection(connection))?;
        (entry.connect)(request).await
    }

    /// Canonical connection kinds (stable sorted).
    #[must_use]
    pub fn canonical_names(&self) -> Vec<String> {
        let names: BTreeSet<_> = self
            .entries
            .values()
            .map(|entry| entry.canonical.to_string())
            .collect();
        names.into_iter().collect()
    }
}

fn normalize_name(name: &str) -> SmolStr {
    SmolStr::new(name.trim().to_ascii_lowercase())
}

fn accept_any_params(_params: &toml::Value) -> Result<(), RuntimeError> {
    Ok(())
}

fn connect_serial(
    request: ConnectRequest,
) -> TransportFuture<'static, Result<Box<dyn Transport>, CommandError>> {
    Box::pin(async move {
        let transport = SerialTransport::open(&request.controller, request.events).await?;
        Ok(Box::new(transport) as Box<dyn Transport>)
    })
}

fn connect_network(
    request: ConnectRequest,
) -> TransportFuture<'static, Result<Box<dyn Transport>, CommandError>> {
    Box::pin(async move {
        let transport = NetworkTransport::open(&request.controller, request.events).await?;
        Ok(Box::new(transport) as Box<dyn Transport>)
    })
}

fn connect_loopback(
    request: ConnectRequest,
) -> TransportFuture<'static, Result<Box<dyn Transport>, CommandError>> {
    Box::pin(async move {
        let transport = LoopbackTransport::new(request.controller.id, request.events);
        Ok(Box::new(transport) as Box<dyn Transport>)
    })
}
