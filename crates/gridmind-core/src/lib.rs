//! Core types and traits for GridMind.
//!
//! This crate defines the domain model shared by the device layer, the
//! anomaly detector and the optimizer, plus the event bus, the injected
//! telemetry store interface, and the cancellable scheduler.

pub mod clock;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod reading;
pub mod scheduler;
pub mod store;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use command::DeviceCommand;
pub use device::{
    Capability, CommandedState, Device, DeviceDescriptor, DeviceId, DeviceState, DeviceStatus,
    DeviceType, Protocol, TransportAddress,
};
pub use error::{Error, Result};
pub use event::{EventMetadata, GridEvent};
pub use eventbus::{EventBus, ReadingStream, SharedEventBus, DEFAULT_CHANNEL_CAPACITY};
pub use reading::Reading;
pub use scheduler::{Scheduler, ShutdownSignal};
pub use store::{InMemoryTelemetryStore, SharedTelemetryStore, TelemetryStore};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::clock::{Clock, SharedClock};
    pub use crate::command::DeviceCommand;
    pub use crate::device::{
        Capability, Device, DeviceDescriptor, DeviceState, DeviceStatus, DeviceType, Protocol,
        TransportAddress,
    };
    pub use crate::error::{Error, Result};
    pub use crate::event::GridEvent;
    pub use crate::eventbus::{EventBus, SharedEventBus};
    pub use crate::reading::Reading;
    pub use crate::store::{SharedTelemetryStore, TelemetryStore};
}
