//! `hydro-runtime` - hardware command transport and automation engine for
//! hydroponics controllers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

/// Block-graph automation engine.
pub mod automation;
/// Clocks for timestamps and loop timeouts.
pub mod clock;
/// Command queues, correlation and controller links.
pub mod command;
/// Runtime configuration (`hydro.toml`).
pub mod config;
/// Runtime and command errors.
pub mod error;
/// Controller transports and wire messages.
pub mod io;

pub use automation::{AutomationEngine, AutomationServices, AutomationState};
pub use command::TransportManager;
pub use config::HydroConfig;
pub use error::{CommandError, RuntimeError};
