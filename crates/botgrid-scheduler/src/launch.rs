//! Launch request overrides and the structured launch result.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use botgrid_core::{ConflictPolicy, InstanceId, LaunchOptions, RestartPolicy};
use botgrid_state::GroupDefinition;

/// Per-launch replacements for stored definition fields.
///
/// Applied to a clone of the stored definition; the stored copy is never
/// modified.
#[derive(Debug, Clone, Default)]
pub struct GroupOverrides {
    pub routine: Option<String>,
    pub variables: Option<HashMap<String, Value>>,
    pub instance_ids: Option<Vec<InstanceId>>,
    pub worker_count: Option<u32>,
    pub account_pool: Option<String>,
    pub restart: Option<RestartPolicy>,
    pub launch: Option<LaunchOptions>,
}

impl GroupOverrides {
    pub fn apply(&self, def: &mut GroupDefinition) {
        if let Some(routine) = &self.routine {
            def.routine = routine.clone();
        }
        if let Some(variables) = &self.variables {
            def.variables = variables.clone();
        }
        if let Some(ids) = &self.instance_ids {
            def.instance_ids = ids.clone();
        }
        if let Some(count) = self.worker_count {
            def.worker_count = count;
        }
        if let Some(pool) = &self.account_pool {
            def.account_pool = Some(pool.clone());
        }
        if let Some(restart) = &self.restart {
            def.restart = restart.clone();
        }
        if let Some(launch) = &self.launch {
            def.launch = launch.clone();
        }
    }
}

/// Stage of a launch an error was reported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchPhase {
    Validation,
    AccountResolution,
    RoutineValidation,
    Acquisition,
    WorkerStart,
}

impl fmt::Display for LaunchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LaunchPhase::Validation => "validation",
            LaunchPhase::AccountResolution => "account_resolution",
            LaunchPhase::RoutineValidation => "routine_validation",
            LaunchPhase::Acquisition => "acquisition",
            LaunchPhase::WorkerStart => "worker_start",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchError {
    pub phase: LaunchPhase,
    pub instance: Option<InstanceId>,
    pub message: String,
}

/// An instance that was owned by another group when we reached it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceConflict {
    pub instance: InstanceId,
    pub owner: String,
    /// Policy that decided what happened next.
    pub resolution: ConflictPolicy,
}

/// Outcome of one launch attempt.
///
/// A launch succeeds when at least one worker started. Shortfalls are
/// reported in `warnings`, per-instance problems in `errors`.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchResult {
    pub group: String,
    pub session_id: String,
    pub success: bool,
    pub requested: u32,
    /// Instances reserved during acquisition, in candidate order.
    pub acquired: Vec<InstanceId>,
    pub workers_started: Vec<InstanceId>,
    pub conflicts: Vec<InstanceConflict>,
    /// Candidates passed over because of an error (launch failure, readiness timeout, ...).
    pub skipped_errors: u32,
    pub errors: Vec<LaunchError>,
    pub warnings: Vec<String>,
    /// Total size of the resolved account pool, if the group uses one.
    pub account_pool_total: Option<usize>,
}

impl LaunchResult {
    pub(crate) fn new(group: &str, session_id: &str, requested: u32) -> Self {
        Self {
            group: group.to_string(),
            session_id: session_id.to_string(),
            success: false,
            requested,
            acquired: Vec::new(),
            workers_started: Vec::new(),
            conflicts: Vec::new(),
            skipped_errors: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            account_pool_total: None,
        }
    }

    pub(crate) fn error(
        &mut self,
        phase: LaunchPhase,
        instance: Option<InstanceId>,
        message: impl Into<String>,
    ) {
        self.errors.push(LaunchError {
            phase,
            instance,
            message: message.into(),
        });
    }

    /// Errors reported from `phase`.
    pub fn errors_in(&self, phase: LaunchPhase) -> impl Iterator<Item = &LaunchError> {
        self.errors.iter().filter(move |e| e.phase == phase)
    }
}
