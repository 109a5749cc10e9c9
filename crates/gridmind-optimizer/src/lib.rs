//! GridMind optimization.
//!
//! Rules pair conditions (time window, power or cost thresholds, device
//! types) with bounded actions. The [`OptimizationEngine`] evaluates them
//! on a fixed interval against a snapshot of online devices and dispatches
//! the resulting commands; the [`LoadBalancer`] trims devices whose recent
//! peaks sit well above the fleet average.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gridmind_core::{EventBus, SystemClock};
//! use gridmind_devices::{AdapterSet, CommandDispatcher, DeviceRegistry};
//! use gridmind_optimizer::{OptimizationEngine, OptimizerConfig};
//!
//! # async fn demo() {
//! let bus = Arc::new(EventBus::new());
//! let registry = Arc::new(DeviceRegistry::new(bus.clone(), 1));
//! let dispatcher = Arc::new(CommandDispatcher::new(registry.clone(), AdapterSet::new(), bus.clone()));
//! let engine = OptimizationEngine::new(
//!     OptimizerConfig::default(),
//!     registry,
//!     dispatcher,
//!     Arc::new(SystemClock::utc()),
//!     bus,
//! );
//! let results = engine.evaluate_once().await;
//! # }
//! ```

pub mod actions;
pub mod balancer;
pub mod confidence;
pub mod config;
pub mod engine;
pub mod error;
pub mod learning;
pub mod result;
pub mod rule;
pub mod tariff;
pub mod window;

pub use actions::{plan, reduced_power, PlannedAction};
pub use balancer::{LoadBalancer, LOAD_BALANCING_RULE};
pub use confidence::{OutcomeStats, Stability};
pub use config::{BalancingStrategy, LoadBalancingConfig, OptimizerConfig};
pub use engine::{DeferredResume, OptimizationEngine, SystemSnapshot};
pub use error::{OptimizerError, Result};
pub use learning::{LearningConfig, PowerBucket, QTable, StateKey};
pub use result::{OptimizationResult, OptimizerStats};
pub use rule::{default_rules, ActionKind, ActionSpec, Condition, OptimizationRule, RuleType};
pub use tariff::{Tariff, TouWindow};
pub use window::TimeWindow;
