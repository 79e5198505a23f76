//! Account pool and execution-tracking collaborators.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::InstanceId;

/// Size of an account pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
}

/// A resolved, leaseable pool of accounts.
#[async_trait]
pub trait AccountPool: Send + Sync {
    fn stats(&self) -> PoolStats;

    /// Reload the pool from its backing source.
    async fn refresh(&self) -> anyhow::Result<()>;

    /// Accounts a worker may try to lease, in preference order.
    fn available_accounts(&self) -> Vec<String>;
}

/// Resolves pool names to pools.
#[async_trait]
pub trait AccountPoolResolver: Send + Sync {
    async fn resolve(&self, pool_name: &str) -> anyhow::Result<Arc<dyn AccountPool>>;
}

/// Numbers a routine reports back after a successful run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Actions executed during the run.
    pub actions: u32,
    /// Free-form counters (items collected, screens visited, ...).
    pub counters: BTreeMap<String, i64>,
}

/// Records routine executions against an account.
pub trait ExecutionTracker: Send + Sync {
    /// Open an execution record and return its id.
    fn start_execution(
        &self,
        account: &str,
        routine: &str,
        session_id: &str,
        instance: InstanceId,
    ) -> anyhow::Result<String>;

    fn complete_execution(
        &self,
        execution_id: &str,
        metrics: &ExecutionMetrics,
    ) -> anyhow::Result<()>;

    fn fail_execution(&self, execution_id: &str, reason: &str) -> anyhow::Result<()>;
}
