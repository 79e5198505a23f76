//! Health monitor error types.

use std::time::Duration;

use thiserror::Error;

use botgrid_core::InstanceId;

/// Errors returned by readiness waits.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HealthError {
    #[error("instance {0} is not tracked")]
    NotTracked(InstanceId),

    #[error("instance {instance} not ready after {timeout:?}")]
    Timeout {
        instance: InstanceId,
        timeout: Duration,
    },

    #[error("instance {0} was untracked while waiting")]
    Untracked(InstanceId),

    #[error("health monitor stopped")]
    MonitorStopped,
}

pub type HealthResult<T> = Result<T, HealthError>;
