//! Group definition, launch option, and routine validation.
//!
//! Validation never stops at the first problem: every check runs and the
//! caller gets the full list back.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;

use botgrid_core::{LaunchOptions, RestartPolicy, RoutineRegistry, TemplateRegistry, UNLIMITED_RETRIES};
use botgrid_state::GroupDefinition;

/// One failed check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

/// Every failed check from one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("{}", join_issues(.issues))]
pub struct ValidationErrors {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationErrors {
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        self.issues.extend(other.issues);
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    /// Whether any issue was reported against `field`.
    pub fn has_field(&self, field: &str) -> bool {
        self.issues.iter().any(|i| i.field == field)
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Check a group blueprint's own fields.
pub fn validate_group_definition(def: &GroupDefinition) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();

    if def.name.trim().is_empty() {
        errors.push("name", "must not be empty");
    }
    if def.routine.trim().is_empty() {
        errors.push("routine", "must not be empty");
    }

    if def.instance_ids.is_empty() {
        errors.push("instance_ids", "at least one candidate instance is required");
    }
    if def.worker_count == 0 {
        errors.push("worker_count", "must be positive");
    } else if def.worker_count as usize > def.instance_ids.len() {
        errors.push(
            "worker_count",
            format!(
                "{} workers requested but only {} candidate instances",
                def.worker_count,
                def.instance_ids.len()
            ),
        );
    }

    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for &id in &def.instance_ids {
        if id < 0 {
            errors.push("instance_ids", format!("instance id {id} is negative"));
        }
        if !seen.insert(id) && reported.insert(id) {
            errors.push("instance_ids", format!("instance id {id} is listed more than once"));
        }
    }

    errors.into_result()
}

/// Check launch options together with the restart policy they run under.
pub fn validate_launch_options(
    options: &LaunchOptions,
    restart: &RestartPolicy,
) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();

    if options.readiness_timeout.is_zero() {
        errors.push("launch.readiness_timeout", "must be positive");
    }

    if restart.enabled {
        if restart.max_retries < UNLIMITED_RETRIES {
            errors.push(
                "restart.max_retries",
                format!("must be >= {UNLIMITED_RETRIES}, got {}", restart.max_retries),
            );
        }
        if restart.initial_delay.is_zero() {
            errors.push("restart.initial_delay", "must be positive");
        }
        if restart.max_delay.is_zero() {
            errors.push("restart.max_delay", "must be positive");
        }
        if restart.initial_delay > restart.max_delay {
            errors.push(
                "restart.initial_delay",
                format!(
                    "{:?} exceeds max_delay {:?}",
                    restart.initial_delay, restart.max_delay
                ),
            );
        }
        if !(restart.backoff_multiplier.is_finite() && restart.backoff_multiplier > 0.0) {
            errors.push(
                "restart.backoff_multiplier",
                format!("must be positive, got {}", restart.backoff_multiplier),
            );
        }
    }

    errors.into_result()
}

/// Everything checked before a group is stored or launched.
pub fn validate_group(def: &GroupDefinition) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    if let Err(e) = validate_group_definition(def) {
        errors.merge(e);
    }
    if let Err(e) = validate_launch_options(&def.launch, &def.restart) {
        errors.merge(e);
    }
    errors.into_result()
}

// ── Routine validation ─────────────────────────────────────────────

/// A problem with the routine a group is about to run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutineIssue {
    #[error("routine not found: {0}")]
    RoutineNotFound(String),

    #[error("routine {routine} cannot be loaded: {reason}")]
    RoutineUnloadable { routine: String, reason: String },

    #[error("routine {routine} references unregistered template {template}")]
    MissingTemplate { routine: String, template: String },

    #[error("routine {routine} does not declare variable {variable}")]
    UnknownVariable { routine: String, variable: String },

    #[error("routine {routine} requires variable {variable}")]
    MissingRequiredVariable { routine: String, variable: String },
}

/// Check that `routine` exists, loads, has its templates registered, and
/// that `overrides` fit its declared variables.
///
/// A required variable is satisfied by an override or by the routine's
/// own default.
pub fn validate_routine(
    routines: &dyn RoutineRegistry,
    templates: &dyn TemplateRegistry,
    routine: &str,
    overrides: &HashMap<String, Value>,
) -> Vec<RoutineIssue> {
    if !routines.has(routine) {
        return vec![RoutineIssue::RoutineNotFound(routine.to_string())];
    }
    if let Err(e) = routines.get(routine) {
        return vec![RoutineIssue::RoutineUnloadable {
            routine: routine.to_string(),
            reason: format!("{e:#}"),
        }];
    }
    let meta = match routines.metadata(routine) {
        Ok(meta) => meta,
        Err(e) => {
            return vec![RoutineIssue::RoutineUnloadable {
                routine: routine.to_string(),
                reason: format!("metadata: {e:#}"),
            }];
        }
    };

    let mut issues = Vec::new();

    for template in &meta.templates {
        if !templates.has(template) {
            issues.push(RoutineIssue::MissingTemplate {
                routine: routine.to_string(),
                template: template.clone(),
            });
        }
    }

    let mut supplied: Vec<&String> = overrides.keys().collect();
    supplied.sort();
    for name in supplied {
        if !meta.available_variables.contains(name) && !meta.required_variables.contains(name) {
            issues.push(RoutineIssue::UnknownVariable {
                routine: routine.to_string(),
                variable: name.clone(),
            });
        }
    }

    for name in &meta.required_variables {
        if !overrides.contains_key(name) && !meta.defaults.contains_key(name) {
            issues.push(RoutineIssue::MissingRequiredVariable {
                routine: routine.to_string(),
                variable: name.clone(),
            });
        }
    }

    issues
}
