//! Per-controller command queues, response correlation and link management.

#![allow(missing_docs)]

mod correlator;
mod manager;
mod queue;

pub use correlator::{Correlator, Resolution};
pub use manager::{CommandSettings, CommandTrace, TransportManager};
