//! GridMind runtime.
//!
//! Loads the `gridmind.toml` document into a [`GridConfig`] and wires the
//! telemetry store, device layer, anomaly detector and optimizer into one
//! [`GridRuntime`] that starts and stops them together.

pub mod config;
pub mod runtime;

pub use config::GridConfig;
pub use runtime::{GridRuntime, RuntimeBuilder};
