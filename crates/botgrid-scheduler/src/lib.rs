//! botgrid-scheduler: group orchestration over shared device instances.
//!
//! Turns stored `GroupDefinition`s (from `botgrid-state`) into running
//! workers, one per device instance. The scheduler:
//!
//! - Validates definitions and launch options, reporting every problem at once
//! - Arbitrates instance ownership between groups (`InstanceRegistry`)
//! - Resolves ownership conflicts by policy (cancel, skip, abort, ask)
//! - Waits for instance readiness through `botgrid-health`
//! - Runs each worker's routine under a restart policy with backoff
//! - Leases one account per worker and releases it on every exit path
//!
//! # Architecture
//!
//! ```text
//! GroupOrchestrator
//!   ├── StateStore (group definitions, account leases, execution records)
//!   ├── InstanceRegistry (instance → owning group, one lock)
//!   ├── HealthMonitor (readiness waits, unready → stop worker)
//!   └── Per-group runtime (session id, cancellation scope)
//!       └── Per-worker tasks
//!           ├── body: RestartExecutor → Routine
//!           └── supervisor: await body, then cleanup (always)
//! ```

pub mod error;
pub mod launch;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod validation;
pub mod worker;

pub use error::{SchedulerError, SchedulerResult};
pub use launch::{GroupOverrides, InstanceConflict, LaunchError, LaunchPhase, LaunchResult};
pub use orchestrator::{GroupOrchestrator, GroupStatus};
pub use registry::{InstanceAssignment, InstanceRegistry};
pub use retry::{RestartExecutor, RunOutcome, TrackingHooks};
pub use validation::{
    RoutineIssue, ValidationErrors, ValidationIssue, validate_group, validate_group_definition,
    validate_launch_options, validate_routine,
};
pub use worker::{WorkerExit, WorkerInfo, WorkerStatus};
