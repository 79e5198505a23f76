//! StateStore: redb-backed state persistence for BotGrid.
//!
//! Provides typed CRUD operations over group definitions and execution
//! records, and (in [`crate::checkout`]) transactional account leasing.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use botgrid_core::config::DEFAULT_LEASE_STALE_AFTER;
use botgrid_core::{ExecutionMetrics, ExecutionTracker, InstanceId};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}
pub(crate) use map_err;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
    /// Leases older than this are treated as absent.
    pub(crate) lease_stale_after: Duration,
    /// Disambiguates execution ids created within the same millisecond.
    exec_seq: Arc<AtomicU64>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Override the lease staleness window (default 10 minutes).
    pub fn with_lease_stale_after(mut self, window: Duration) -> Self {
        self.lease_stale_after = window;
        self
    }

    pub fn lease_stale_after(&self) -> Duration {
        self.lease_stale_after
    }

    fn from_db(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            lease_stale_after: DEFAULT_LEASE_STALE_AFTER,
            exec_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(ACCOUNT_LEASES).map_err(map_err!(Table))?;
        txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Group definitions ──────────────────────────────────────────

    /// Insert a new group definition; fails if the name is taken.
    pub fn create_group(&self, def: &GroupDefinition) -> StateResult<()> {
        let value = serde_json::to_vec(def).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            let exists = table
                .get(def.name.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if exists {
                return Err(StateError::AlreadyExists(def.name.clone()));
            }
            table
                .insert(def.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(group = %def.name, "group definition created");
        Ok(())
    }

    /// Insert or update a group definition.
    pub fn put_group(&self, def: &GroupDefinition) -> StateResult<()> {
        let value = serde_json::to_vec(def).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            table
                .insert(def.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(group = %def.name, "group definition stored");
        Ok(())
    }

    /// Get a group definition by name.
    pub fn get_group(&self, name: &str) -> StateResult<Option<GroupDefinition>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let def: GroupDefinition =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(def))
            }
            None => Ok(None),
        }
    }

    /// List all group definitions, ordered by name.
    pub fn list_groups(&self) -> StateResult<Vec<GroupDefinition>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let def: GroupDefinition =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(def);
        }
        Ok(results)
    }

    /// Delete a group definition. Returns true if it existed.
    pub fn delete_group(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(group = %name, existed, "group definition deleted");
        Ok(existed)
    }

    // ── Execution records ──────────────────────────────────────────

    /// Open a `Running` execution record and return its id.
    pub fn open_execution(
        &self,
        account: &str,
        routine: &str,
        session_id: &str,
        instance: InstanceId,
    ) -> StateResult<String> {
        let now = epoch_millis();
        let seq = self.exec_seq.fetch_add(1, Ordering::Relaxed);
        let record = ExecutionRecord {
            id: format!("{session_id}:{instance}:{now}-{seq}"),
            account: account.to_string(),
            routine: routine.to_string(),
            session_id: session_id.to_string(),
            instance,
            status: ExecutionStatus::Running,
            started_at_ms: now,
            finished_at_ms: None,
            metrics: None,
            failure: None,
        };
        self.put_execution(&record)?;
        Ok(record.id)
    }

    /// Mark an execution completed with its metrics.
    pub fn finish_execution(&self, id: &str, metrics: &ExecutionMetrics) -> StateResult<()> {
        let mut record = self
            .get_execution(id)?
            .ok_or_else(|| StateError::NotFound(format!("execution {id}")))?;
        record.status = ExecutionStatus::Completed;
        record.finished_at_ms = Some(epoch_millis());
        record.metrics = Some(metrics.clone());
        self.put_execution(&record)
    }

    /// Mark an execution failed with a reason.
    pub fn abort_execution(&self, id: &str, reason: &str) -> StateResult<()> {
        let mut record = self
            .get_execution(id)?
            .ok_or_else(|| StateError::NotFound(format!("execution {id}")))?;
        record.status = ExecutionStatus::Failed;
        record.finished_at_ms = Some(epoch_millis());
        record.failure = Some(reason.to_string());
        self.put_execution(&record)
    }

    fn put_execution(&self, record: &ExecutionRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an execution record by id.
    pub fn get_execution(&self, id: &str) -> StateResult<Option<ExecutionRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ExecutionRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List every execution recorded for an orchestration session.
    pub fn list_executions_for_session(
        &self,
        session_id: &str,
    ) -> StateResult<Vec<ExecutionRecord>> {
        let prefix = format!("{session_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: ExecutionRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }
}

impl ExecutionTracker for StateStore {
    fn start_execution(
        &self,
        account: &str,
        routine: &str,
        session_id: &str,
        instance: InstanceId,
    ) -> anyhow::Result<String> {
        Ok(self.open_execution(account, routine, session_id, instance)?)
    }

    fn complete_execution(
        &self,
        execution_id: &str,
        metrics: &ExecutionMetrics,
    ) -> anyhow::Result<()> {
        Ok(self.finish_execution(execution_id, metrics)?)
    }

    fn fail_execution(&self, execution_id: &str, reason: &str) -> anyhow::Result<()> {
        Ok(self.abort_execution(execution_id, reason)?)
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_group(name: &str) -> GroupDefinition {
        let mut def = GroupDefinition::new(name, "daily-farm", vec![0, 1, 2], 2);
        def.tags = vec!["farm".to_string()];
        def.created_at = 1000;
        def.updated_at = 1000;
        def
    }

    // ── Group CRUD ─────────────────────────────────────────────────

    #[test]
    fn group_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let def = test_group("farmers");

        store.put_group(&def).unwrap();
        assert_eq!(store.get_group("farmers").unwrap(), Some(def));
    }

    #[test]
    fn group_create_rejects_duplicate_name() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_group(&test_group("farmers")).unwrap();

        let err = store.create_group(&test_group("farmers")).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(name) if name == "farmers"));
    }

    #[test]
    fn group_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut def = test_group("farmers");
        store.put_group(&def).unwrap();

        def.worker_count = 3;
        def.updated_at = 2000;
        store.put_group(&def).unwrap();

        let retrieved = store.get_group("farmers").unwrap().unwrap();
        assert_eq!(retrieved.worker_count, 3);
        assert_eq!(retrieved.updated_at, 2000);
        assert_eq!(store.list_groups().unwrap().len(), 1);
    }

    #[test]
    fn group_list_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_group(&test_group("a")).unwrap();
        store.put_group(&test_group("b")).unwrap();

        let names: Vec<_> = store
            .list_groups()
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(store.delete_group("a").unwrap());
        assert!(!store.delete_group("a").unwrap());
        assert!(store.get_group("a").unwrap().is_none());
    }

    // ── Executions ─────────────────────────────────────────────────

    #[test]
    fn execution_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store
            .open_execution("acct-1", "daily-farm", "session-a", 3)
            .unwrap();

        let running = store.get_execution(&id).unwrap().unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);
        assert_eq!(running.instance, 3);

        let mut metrics = ExecutionMetrics::default();
        metrics.actions = 12;
        store.finish_execution(&id, &metrics).unwrap();

        let done = store.get_execution(&id).unwrap().unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.metrics.unwrap().actions, 12);
        assert!(done.finished_at_ms.is_some());
    }

    #[test]
    fn execution_failure_records_reason() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store
            .open_execution("acct-1", "daily-farm", "session-a", 0)
            .unwrap();
        store.abort_execution(&id, "template not found").unwrap();

        let record = store.get_execution(&id).unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.failure.as_deref(), Some("template not found"));
    }

    #[test]
    fn finishing_unknown_execution_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .finish_execution("missing", &ExecutionMetrics::default())
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn executions_listed_per_session() {
        let store = StateStore::open_in_memory().unwrap();
        store.open_execution("a", "r", "session-a", 0).unwrap();
        store.open_execution("a", "r", "session-a", 0).unwrap();
        store.open_execution("b", "r", "session-b", 1).unwrap();

        assert_eq!(store.list_executions_for_session("session-a").unwrap().len(), 2);
        assert_eq!(store.list_executions_for_session("session-b").unwrap().len(), 1);
        assert!(store.list_executions_for_session("session-c").unwrap().is_empty());
    }

    #[test]
    fn tracker_trait_routes_to_store() {
        let store = StateStore::open_in_memory().unwrap();
        let tracker: &dyn ExecutionTracker = &store;

        let id = tracker.start_execution("acct", "r", "s", 2).unwrap();
        tracker.fail_execution(&id, "boom").unwrap();
        assert_eq!(
            store.get_execution(&id).unwrap().unwrap().status,
            ExecutionStatus::Failed
        );
        assert!(tracker.complete_execution("nope", &ExecutionMetrics::default()).is_err());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_group(&test_group("farmers")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let def = store.get_group("farmers").unwrap();
        assert_eq!(def.unwrap().routine, "daily-farm");
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_groups().unwrap().is_empty());
        assert!(store.get_group("nope").unwrap().is_none());
        assert!(!store.delete_group("nope").unwrap());
        assert!(store.get_execution("nope").unwrap().is_none());
    }
}
