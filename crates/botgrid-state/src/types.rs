//! Domain types for the BotGrid state store.
//!
//! These types represent the persisted state of group blueprints,
//! account leases, and execution records. All types are serializable
//! to/from JSON for storage in redb tables.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use botgrid_core::{ExecutionMetrics, InstanceId, LaunchOptions, RestartPolicy};

// ── Group definition ───────────────────────────────────────────────

/// Persisted blueprint for a group of workers.
///
/// Independent of runtime state: a definition can exist with no running
/// group, and a running group keeps its own copy of these fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupDefinition {
    /// Unique key.
    pub name: String,
    /// Routine every worker in the group executes.
    pub routine: String,
    /// Overrides for the routine's configuration variables.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Instances the group may run on, in preference order.
    pub instance_ids: Vec<InstanceId>,
    /// Desired number of concurrent workers.
    pub worker_count: u32,
    /// Account pool workers lease from, if any.
    #[serde(default)]
    pub account_pool: Option<String>,
    pub launch: LaunchOptions,
    pub restart: RestartPolicy,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Unix timestamp (seconds) when this definition was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) when this definition was last updated.
    pub updated_at: u64,
}

impl GroupDefinition {
    /// Minimal definition with default launch/restart settings.
    pub fn new(
        name: impl Into<String>,
        routine: impl Into<String>,
        instance_ids: Vec<InstanceId>,
        worker_count: u32,
    ) -> Self {
        Self {
            name: name.into(),
            routine: routine.into(),
            variables: HashMap::new(),
            instance_ids,
            worker_count,
            account_pool: None,
            launch: LaunchOptions::default(),
            restart: RestartPolicy::default(),
            tags: Vec::new(),
            created_at: 0,
            updated_at: 0,
        }
    }
}

// ── Account lease ──────────────────────────────────────────────────

/// A session's claim on one account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountLease {
    pub account: String,
    /// Orchestration session holding the lease.
    pub session_id: String,
    /// Instance the account is in use on.
    pub instance: InstanceId,
    /// Unix timestamp (milliseconds) when the lease was taken.
    pub leased_at_ms: u64,
}

impl AccountLease {
    /// Age of the lease at `now_ms`.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.leased_at_ms)
    }
}

// ── Execution record ───────────────────────────────────────────────

/// Lifecycle of one tracked routine execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// One routine run against an account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub id: String,
    pub account: String,
    pub routine: String,
    pub session_id: String,
    pub instance: InstanceId,
    pub status: ExecutionStatus,
    /// Unix timestamp (milliseconds).
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub metrics: Option<ExecutionMetrics>,
    pub failure: Option<String>,
}
