//! Worker records and exit classification.

use std::fmt;

use serde::Serialize;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use botgrid_core::InstanceId;

use crate::error::SchedulerResult;
use crate::retry::RunOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Completed,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Stopped | WorkerStatus::Failed | WorkerStatus::Completed
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Failed => "failed",
            WorkerStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one active worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub instance: InstanceId,
    pub account: Option<String>,
    pub status: WorkerStatus,
    /// Unix timestamp (seconds).
    pub started_at: u64,
    pub last_error: Option<String>,
}

/// A worker that has left the active set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerExit {
    pub worker_id: String,
    pub instance: InstanceId,
    pub account: Option<String>,
    pub status: WorkerStatus,
    pub error: Option<String>,
    /// Unix timestamp (seconds).
    pub finished_at: u64,
}

/// Handles to a spawned worker.
pub(crate) struct WorkerHandles {
    /// Runs cleanup after the body exits; await this to know the worker is gone.
    pub supervisor: tokio::task::JoinHandle<()>,
    /// Aborts the routine body; the supervisor still runs cleanup.
    pub body: tokio::task::AbortHandle,
}

/// An active worker as held by its group.
pub(crate) struct WorkerSlot {
    pub info: WorkerInfo,
    pub cancel: CancellationToken,
    pub handles: Option<WorkerHandles>,
}

/// Terminal status and error text for a finished worker body.
pub(crate) fn classify_exit(
    joined: Result<SchedulerResult<RunOutcome>, JoinError>,
) -> (WorkerStatus, Option<String>) {
    match joined {
        Ok(Ok(RunOutcome::Completed(_))) => (WorkerStatus::Completed, None),
        Ok(Ok(RunOutcome::Cancelled { .. })) => (WorkerStatus::Stopped, None),
        Ok(Err(e)) => (WorkerStatus::Failed, Some(e.to_string())),
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            (WorkerStatus::Failed, Some(format!("worker panicked: {message}")))
        }
        Err(_) => (WorkerStatus::Stopped, Some("worker aborted".to_string())),
    }
}
