//! Routine and template collaborators, plus the per-worker variable store.
//!
//! Routines are defined and executed outside BotGrid. The orchestrator
//! validates them through [`RoutineRegistry`]/[`TemplateRegistry`] and the
//! restart executor drives them through [`Routine::execute`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::accounts::ExecutionMetrics;
use crate::types::InstanceId;

/// Declared shape of a routine, used for pre-launch validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutineMetadata {
    /// Template names the routine matches against.
    pub templates: BTreeSet<String>,
    /// Variables that must be supplied by the group.
    pub required_variables: BTreeSet<String>,
    /// Every variable the routine understands (superset of required).
    pub available_variables: BTreeSet<String>,
    /// Default values for configuration variables.
    pub defaults: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
struct Variable {
    value: Value,
    persistent: bool,
}

/// Named values shared between a routine's actions.
///
/// Transient values are cleared before every restart; persistent ones
/// survive for the lifetime of the worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutineVariables {
    values: HashMap<String, Variable>,
}

impl RoutineVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).map(|v| &v.value)
    }

    /// Set a transient value.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(
            name.into(),
            Variable {
                value,
                persistent: false,
            },
        );
    }

    /// Set a value that survives [`clear_transient`](Self::clear_transient).
    pub fn set_persistent(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(
            name.into(),
            Variable {
                value,
                persistent: true,
            },
        );
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name).map(|v| v.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drop every non-persistent value.
    pub fn clear_transient(&mut self) {
        self.values.retain(|_, v| v.persistent);
    }

    /// Re-initialize configuration variables: defaults first, then overrides.
    pub fn apply_config(
        &mut self,
        defaults: &HashMap<String, Value>,
        overrides: &HashMap<String, Value>,
    ) {
        for (name, value) in defaults.iter().chain(overrides.iter()) {
            self.set(name.clone(), value.clone());
        }
    }
}

/// Everything a routine invocation can see about the worker running it.
#[derive(Debug, Clone)]
pub struct RoutineContext {
    pub instance: InstanceId,
    /// Account leased for this worker, if the group uses an account pool.
    pub account: Option<String>,
    pub variables: RoutineVariables,
    /// Cancelled when the worker is asked to stop.
    pub cancel: CancellationToken,
}

impl RoutineContext {
    pub fn new(instance: InstanceId, account: Option<String>, cancel: CancellationToken) -> Self {
        Self {
            instance,
            account,
            variables: RoutineVariables::new(),
            cancel,
        }
    }

    /// Routines should poll this between actions.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// An executable routine.
#[async_trait]
pub trait Routine: Send + Sync {
    /// Run the routine once to completion or failure.
    async fn execute(&self, ctx: &mut RoutineContext) -> anyhow::Result<ExecutionMetrics>;
}

/// Lookup of routines by name.
pub trait RoutineRegistry: Send + Sync {
    fn has(&self, name: &str) -> bool;

    /// Load an executable routine; fails if it cannot be parsed or built.
    fn get(&self, name: &str) -> anyhow::Result<Arc<dyn Routine>>;

    fn metadata(&self, name: &str) -> anyhow::Result<RoutineMetadata>;
}

/// Lookup of recognition templates by name.
pub trait TemplateRegistry: Send + Sync {
    fn has(&self, name: &str) -> bool;
}
