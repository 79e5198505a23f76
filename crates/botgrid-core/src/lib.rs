//! botgrid-core: shared vocabulary for the BotGrid orchestrator.
//!
//! Holds the domain types every other crate agrees on (instance ids,
//! restart/launch policies), the narrow traits through which the
//! orchestrator talks to its external collaborators (device lifecycle,
//! routines, templates, account pools, execution tracking), and the
//! `botgrid.toml` configuration parser.

pub mod accounts;
pub mod config;
pub mod device;
pub mod routine;
pub mod types;

pub use accounts::{AccountPool, AccountPoolResolver, ExecutionMetrics, ExecutionTracker, PoolStats};
pub use config::{BotgridConfig, ConfigError};
pub use device::{DeviceInstance, DeviceLifecycle};
pub use routine::{
    Routine, RoutineContext, RoutineMetadata, RoutineRegistry, RoutineVariables, TemplateRegistry,
};
pub use types::*;
