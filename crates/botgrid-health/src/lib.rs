//! botgrid-health: readiness tracking for device instances.
//!
//! An instance is *ready* when its surface is detected and its control
//! channel is connected. The monitor polls every tracked instance on a
//! fixed period and fans out transitions to two kinds of listeners.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── Poll loop (one background task, 1s period)
//!   │   ├── discover_instances() / get_instance() → surface signal
//!   │   ├── probe_connection()                    → connected signal
//!   │   ├── pass 1: update InstanceHealthStatus under the table lock
//!   │   └── pass 2: notify with no lock held
//!   ├── wait_for_ready()   one-shot waiters (watch channel per instance)
//!   └── on_health_change() level-triggered callbacks, each on its own task
//! ```
//!
//! Untracking an instance drops its watch sender and its callbacks, so
//! pending waiters error out instead of leaking across launch/stop cycles.

pub mod error;
pub mod monitor;
pub mod tracker;

pub use error::{HealthError, HealthResult};
pub use monitor::{BoxFuture, HealthCallback, HealthMonitor};
pub use tracker::InstanceHealthStatus;
