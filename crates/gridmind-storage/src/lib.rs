//! Persistent telemetry storage for GridMind.
//!
//! The runtime talks to storage only through
//! [`gridmind_core::store::TelemetryStore`]; this crate provides the redb
//! implementation selected by `[storage] backend = "redb"`.

pub mod error;
pub mod telemetry;

pub use error::{Result, StorageError};
pub use telemetry::RedbTelemetryStore;
