//! Scheduler error types.

use thiserror::Error;

use botgrid_core::InstanceId;

use crate::validation::ValidationErrors;

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("group is running: {0}")]
    GroupRunning(String),

    #[error("group is not running: {0}")]
    GroupNotRunning(String),

    #[error("no worker on instance {instance} in group {group}")]
    WorkerNotFound { group: String, instance: InstanceId },

    #[error("instance {instance} is owned by group {owner}")]
    InstanceOwned { instance: InstanceId, owner: String },

    #[error("instance {instance} is owned by group {owner}, not {caller}")]
    NotOwner {
        instance: InstanceId,
        owner: String,
        caller: String,
    },

    #[error("invalid group definition: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("routine failed: {0:#}")]
    RoutineFailed(#[source] anyhow::Error),

    #[error("routine failed after {retries} retries: {last_error:#}")]
    RetriesExhausted {
        retries: u32,
        #[source]
        last_error: anyhow::Error,
    },

    #[error("state store error: {0}")]
    State(#[from] botgrid_state::StateError),

    #[error("collaborator error: {0:#}")]
    Collaborator(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
