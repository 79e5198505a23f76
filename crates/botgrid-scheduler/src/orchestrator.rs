//! Group orchestrator: group lifecycle, launch, and worker supervision.
//!
//! A launch runs four phases (account resolution, routine validation,
//! instance acquisition, staggered worker start) and reports what
//! happened in a [`LaunchResult`] instead of failing on the first problem.
//!
//! Each worker is two tasks: the body runs the [`RestartExecutor`], and a
//! supervisor awaits the body and then always runs cleanup, so a panic
//! or an abort inside the body can never leak the instance or the lease.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use botgrid_core::config::DEFAULT_STOP_TIMEOUT;
use botgrid_core::{
    AccountPool, AccountPoolResolver, ConflictPolicy, DeviceLifecycle, ExecutionTracker,
    InstanceId, LaunchOptions, Routine, RoutineContext, RoutineRegistry, TemplateRegistry,
};
use botgrid_health::{BoxFuture, HealthMonitor};
use botgrid_state::store::{epoch_millis, epoch_secs};
use botgrid_state::{GroupDefinition, StateError, StateStore};

use crate::error::{SchedulerError, SchedulerResult};
use crate::launch::{GroupOverrides, InstanceConflict, LaunchPhase, LaunchResult};
use crate::registry::InstanceRegistry;
use crate::retry::{RestartExecutor, TrackingHooks};
use crate::validation::{RoutineIssue, validate_group, validate_routine};
use crate::worker::{WorkerExit, WorkerHandles, WorkerInfo, WorkerSlot, WorkerStatus, classify_exit};

/// How many finished workers a group remembers.
const RECENT_EXITS: usize = 32;

/// Runtime state of one launched group.
struct GroupRuntime {
    name: String,
    session_id: String,
    definition: GroupDefinition,
    /// Parent of every worker's token.
    cancel: CancellationToken,
    workers: RwLock<HashMap<InstanceId, WorkerSlot>>,
    recent_exits: RwLock<VecDeque<WorkerExit>>,
    launching: AtomicBool,
    running: AtomicBool,
}

impl GroupRuntime {
    fn new(definition: GroupDefinition, session_id: String) -> Self {
        Self {
            name: definition.name.clone(),
            session_id,
            definition,
            cancel: CancellationToken::new(),
            workers: RwLock::new(HashMap::new()),
            recent_exits: RwLock::new(VecDeque::new()),
            launching: AtomicBool::new(true),
            running: AtomicBool::new(false),
        }
    }

    fn is_active(&self) -> bool {
        self.launching.load(Ordering::SeqCst) || self.running.load(Ordering::SeqCst)
    }

    async fn set_status(&self, instance: InstanceId, status: WorkerStatus) {
        if let Some(slot) = self.workers.write().await.get_mut(&instance) {
            slot.info.status = status;
        }
    }

    async fn record_exit(&self, exit: WorkerExit) {
        let mut exits = self.recent_exits.write().await;
        if exits.len() == RECENT_EXITS {
            exits.pop_front();
        }
        exits.push_back(exit);
    }
}

/// Point-in-time view of a group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub name: String,
    pub session_id: String,
    pub running: bool,
    pub workers: Vec<WorkerInfo>,
    /// Oldest first.
    pub recent_exits: Vec<WorkerExit>,
}

/// Owns group definitions and every running group.
#[derive(Clone)]
pub struct GroupOrchestrator {
    store: StateStore,
    registry: Arc<InstanceRegistry>,
    health: HealthMonitor,
    devices: Arc<dyn DeviceLifecycle>,
    routines: Arc<dyn RoutineRegistry>,
    templates: Arc<dyn TemplateRegistry>,
    pools: Option<Arc<dyn AccountPoolResolver>>,
    tracker: Arc<dyn ExecutionTracker>,
    stop_timeout: Duration,
    /// Launched groups: name → runtime.
    groups: Arc<RwLock<HashMap<String, Arc<GroupRuntime>>>>,
}

impl GroupOrchestrator {
    /// Create an orchestrator. Executions are tracked in `store` unless
    /// [`with_tracker`](Self::with_tracker) says otherwise.
    pub fn new(
        store: StateStore,
        health: HealthMonitor,
        devices: Arc<dyn DeviceLifecycle>,
        routines: Arc<dyn RoutineRegistry>,
        templates: Arc<dyn TemplateRegistry>,
    ) -> Self {
        Self {
            tracker: Arc::new(store.clone()),
            store,
            registry: Arc::new(InstanceRegistry::new()),
            health,
            devices,
            routines,
            templates,
            pools: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            groups: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_account_pools(mut self, resolver: Arc<dyn AccountPoolResolver>) -> Self {
        self.pools = Some(resolver);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ExecutionTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// How long a stop waits for workers before aborting them.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Share an instance registry with another orchestrator.
    pub fn with_registry(mut self, registry: Arc<InstanceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Definitions ────────────────────────────────────────────────

    /// Validate and store a new definition.
    pub fn create_group(&self, mut def: GroupDefinition) -> SchedulerResult<GroupDefinition> {
        validate_group(&def)?;
        let now = epoch_secs();
        def.created_at = now;
        def.updated_at = now;
        self.store.create_group(&def)?;
        info!(group = %def.name, routine = %def.routine, "group created");
        Ok(def)
    }

    /// Create or replace a definition.
    pub async fn save_group(&self, def: GroupDefinition) -> SchedulerResult<GroupDefinition> {
        match self.store.get_group(&def.name)? {
            Some(_) => self.update_group(def).await,
            None => self.create_group(def),
        }
    }

    pub fn get_group(&self, name: &str) -> SchedulerResult<GroupDefinition> {
        self.store
            .get_group(name)?
            .ok_or_else(|| SchedulerError::GroupNotFound(name.to_string()))
    }

    pub fn list_groups(&self) -> SchedulerResult<Vec<GroupDefinition>> {
        Ok(self.store.list_groups()?)
    }

    /// Replace an existing definition. Rejected while the group runs.
    pub async fn update_group(&self, mut def: GroupDefinition) -> SchedulerResult<GroupDefinition> {
        let existing = self.get_group(&def.name)?;
        if self.is_running(&def.name).await {
            return Err(SchedulerError::GroupRunning(def.name));
        }
        validate_group(&def)?;

        def.created_at = existing.created_at;
        def.updated_at = epoch_secs();
        self.store.put_group(&def)?;
        info!(group = %def.name, "group updated");
        Ok(def)
    }

    /// Delete a definition. Rejected while the group runs.
    pub async fn delete_group(&self, name: &str) -> SchedulerResult<bool> {
        if self.is_running(name).await {
            return Err(SchedulerError::GroupRunning(name.to_string()));
        }
        let existed = self.store.delete_group(name)?;
        {
            let mut groups = self.groups.write().await;
            if groups.get(name).is_some_and(|rt| !rt.is_active()) {
                groups.remove(name);
            }
        }
        if existed {
            info!(group = %name, "group deleted");
        }
        Ok(existed)
    }

    // ── Launch ─────────────────────────────────────────────────────

    /// Launch a stored group. `options` replaces the stored launch options.
    pub async fn launch_group(
        &self,
        name: &str,
        options: Option<LaunchOptions>,
    ) -> SchedulerResult<LaunchResult> {
        self.launch_group_with_overrides(name, options, GroupOverrides::default())
            .await
    }

    /// Launch a stored group with some definition fields replaced for
    /// this launch only.
    ///
    /// Fails with an error only if the group is unknown, already running,
    /// or the store fails; every other problem is reported in the result.
    pub async fn launch_group_with_overrides(
        &self,
        name: &str,
        options: Option<LaunchOptions>,
        overrides: GroupOverrides,
    ) -> SchedulerResult<LaunchResult> {
        let mut def = self.get_group(name)?;
        overrides.apply(&mut def);
        if let Some(options) = options {
            def.launch = options;
        }

        let session_id = generate_session_id(name);
        let mut result = LaunchResult::new(name, &session_id, def.worker_count);

        if let Err(errors) = validate_group(&def) {
            warn!(group = %name, issues = errors.len(), "launch rejected by validation");
            for issue in errors.issues {
                result.error(LaunchPhase::Validation, None, issue.to_string());
            }
            return Ok(result);
        }

        let runtime = Arc::new(GroupRuntime::new(def, session_id));
        {
            let mut groups = self.groups.write().await;
            if groups.get(name).is_some_and(|rt| rt.is_active()) {
                return Err(SchedulerError::GroupRunning(name.to_string()));
            }
            groups.insert(name.to_string(), Arc::clone(&runtime));
        }
        info!(group = %name, session = %runtime.session_id, "launching group");

        self.run_launch(&runtime, &mut result).await;
        runtime.launching.store(false, Ordering::SeqCst);

        if result.success {
            info!(
                group = %name,
                session = %runtime.session_id,
                workers = result.workers_started.len(),
                requested = result.requested,
                "group launched"
            );
        } else {
            let mut groups = self.groups.write().await;
            if groups.get(name).is_some_and(|rt| Arc::ptr_eq(rt, &runtime)) {
                groups.remove(name);
            }
            warn!(group = %name, errors = result.errors.len(), "group launch failed");
        }
        Ok(result)
    }

    async fn run_launch(&self, runtime: &Arc<GroupRuntime>, result: &mut LaunchResult) {
        let def = &runtime.definition;

        // Phase 1: account pool.
        let pool = match &def.account_pool {
            Some(pool_name) => match self.resolve_pool(pool_name, result).await {
                Some(pool) => Some(pool),
                None => return,
            },
            None => None,
        };

        // Phase 2: routine.
        let Some((routine, defaults)) = self.load_routine(def, result) else {
            return;
        };

        // Phase 3: instances.
        let acquired = self.acquire_instances(runtime, result).await;
        if acquired.is_empty() {
            result.error(LaunchPhase::Acquisition, None, "no instances acquired");
            return;
        }
        if acquired.len() < def.worker_count as usize {
            result.warnings.push(format!(
                "acquired {} of {} requested instances",
                acquired.len(),
                def.worker_count
            ));
        }
        result.acquired = acquired.clone();

        // Phase 4: workers.
        self.start_workers(runtime, &acquired, routine, defaults, pool, result)
            .await;
        if result.workers_started.is_empty() {
            result.error(LaunchPhase::WorkerStart, None, "no workers started");
            return;
        }
        result.success = true;
    }

    async fn resolve_pool(
        &self,
        pool_name: &str,
        result: &mut LaunchResult,
    ) -> Option<Arc<dyn AccountPool>> {
        let Some(resolver) = &self.pools else {
            result.error(
                LaunchPhase::AccountResolution,
                None,
                format!("account pool {pool_name} requested but no resolver is configured"),
            );
            return None;
        };

        let pool = match resolver.resolve(pool_name).await {
            Ok(pool) => pool,
            Err(e) => {
                result.error(
                    LaunchPhase::AccountResolution,
                    None,
                    format!("failed to resolve account pool {pool_name}: {e:#}"),
                );
                return None;
            }
        };
        if let Err(e) = pool.refresh().await {
            warn!(pool = %pool_name, error = %e, "account pool refresh failed, using cached accounts");
        }

        let stats = pool.stats();
        result.account_pool_total = Some(stats.total);
        if stats.available == 0 {
            result
                .warnings
                .push(format!("account pool {pool_name} has no available accounts"));
        }
        debug!(pool = %pool_name, total = stats.total, available = stats.available, "account pool resolved");
        Some(pool)
    }

    fn load_routine(
        &self,
        def: &GroupDefinition,
        result: &mut LaunchResult,
    ) -> Option<(Arc<dyn Routine>, HashMap<String, Value>)> {
        if def.launch.validate_routine {
            let issues = validate_routine(
                self.routines.as_ref(),
                self.templates.as_ref(),
                &def.routine,
                &def.variables,
            );
            if !issues.is_empty() {
                for issue in issues {
                    result.error(LaunchPhase::RoutineValidation, None, issue.to_string());
                }
                return None;
            }
        }

        let routine = match self.routines.get(&def.routine) {
            Ok(routine) => routine,
            Err(e) => {
                let issue = RoutineIssue::RoutineUnloadable {
                    routine: def.routine.clone(),
                    reason: format!("{e:#}"),
                };
                result.error(LaunchPhase::RoutineValidation, None, issue.to_string());
                return None;
            }
        };
        let defaults = match self.routines.metadata(&def.routine) {
            Ok(meta) => meta.defaults,
            Err(e) => {
                warn!(routine = %def.routine, error = %e, "routine metadata unavailable, running without defaults");
                HashMap::new()
            }
        };
        Some((routine, defaults))
    }

    /// Walk candidates in order until enough instances are reserved.
    async fn acquire_instances(
        &self,
        runtime: &GroupRuntime,
        result: &mut LaunchResult,
    ) -> Vec<InstanceId> {
        let def = &runtime.definition;
        let policy = def.launch.conflict_policy;
        let requested = def.worker_count as usize;
        let mut acquired = Vec::with_capacity(requested);

        self.health.start().await;

        for &instance in &def.instance_ids {
            if acquired.len() >= requested || runtime.cancel.is_cancelled() {
                break;
            }

            let (available, owner) = self
                .registry
                .check_availability(instance, &runtime.name)
                .await;
            if !available {
                let owner = owner.unwrap_or_default();
                result.conflicts.push(InstanceConflict {
                    instance,
                    owner: owner.clone(),
                    resolution: policy,
                });
                match policy {
                    ConflictPolicy::Skip => {
                        debug!(group = %runtime.name, instance, %owner, "instance owned, skipping");
                        continue;
                    }
                    ConflictPolicy::Ask => {
                        warn!(group = %runtime.name, instance, %owner, "unresolved conflict, skipping instance");
                        continue;
                    }
                    ConflictPolicy::Abort => {
                        warn!(group = %runtime.name, instance, %owner, "instance owned, aborting acquisition");
                        result
                            .warnings
                            .push(format!("acquisition aborted at instance {instance} owned by {owner}"));
                        break;
                    }
                    ConflictPolicy::Cancel => {
                        if let Err(e) = self.evict(instance, &owner).await {
                            result.error(
                                LaunchPhase::Acquisition,
                                Some(instance),
                                format!("could not take instance from {owner}: {e}"),
                            );
                            result.skipped_errors += 1;
                            continue;
                        }
                    }
                }
            }

            if let Err(message) = self
                .prepare_instance(instance, def.launch.readiness_timeout)
                .await
            {
                self.health.untrack_instance(instance).await;
                result.error(LaunchPhase::Acquisition, Some(instance), message);
                result.skipped_errors += 1;
                continue;
            }

            let worker_id = worker_id(&runtime.name, instance);
            match self
                .registry
                .reserve(instance, &runtime.name, &worker_id)
                .await
            {
                Ok(()) => acquired.push(instance),
                Err(e) => {
                    self.health.untrack_instance(instance).await;
                    result.error(LaunchPhase::Acquisition, Some(instance), e.to_string());
                    result.skipped_errors += 1;
                }
            }
        }

        acquired
    }

    /// Bring an instance up if needed and wait until it is ready.
    async fn prepare_instance(&self, instance: InstanceId, timeout: Duration) -> Result<(), String> {
        self.health.track_instance(instance).await;

        let device = match self.devices.get_instance(instance).await {
            Ok(device) => device,
            Err(e) => {
                debug!(instance, error = %e, "instance lookup failed");
                None
            }
        };

        if !device.as_ref().is_some_and(|d| d.surface_detected) {
            info!(instance, "instance not running, launching");
            self.devices
                .launch_instance(instance)
                .await
                .map_err(|e| format!("failed to launch instance: {e:#}"))?;
        }
        if !device.as_ref().is_some_and(|d| d.connected) {
            if let Err(e) = self.devices.connect_instance(instance).await {
                warn!(instance, error = %e, "connect failed, waiting for readiness anyway");
            }
        }

        self.health
            .wait_for_ready(instance, timeout)
            .await
            .map_err(|e| {
                warn!(instance, error = %e, "instance not ready");
                e.to_string()
            })
    }

    /// Take `instance` away from `owner`: stop its worker there, or drop
    /// the reservation if no worker runs.
    ///
    /// A reservation held by a group that is still launching has no worker
    /// yet and is left alone.
    async fn evict(&self, instance: InstanceId, owner: &str) -> SchedulerResult<()> {
        let runtime = self.groups.read().await.get(owner).cloned();
        let stopped = match &runtime {
            Some(runtime) => self.stop_worker_in(runtime, instance).await,
            None => false,
        };
        if !stopped {
            if runtime.is_some_and(|rt| rt.launching.load(Ordering::SeqCst)) {
                return Err(SchedulerError::InstanceOwned {
                    instance,
                    owner: owner.to_string(),
                });
            }
            self.registry.release(instance, owner).await?;
        }
        info!(instance, %owner, stopped, "instance taken over");
        Ok(())
    }

    async fn start_workers(
        &self,
        runtime: &Arc<GroupRuntime>,
        acquired: &[InstanceId],
        routine: Arc<dyn Routine>,
        defaults: HashMap<String, Value>,
        pool: Option<Arc<dyn AccountPool>>,
        result: &mut LaunchResult,
    ) {
        let def = &runtime.definition;
        let stagger = def.launch.stagger_delay;

        for (i, &instance) in acquired.iter().enumerate() {
            if runtime.cancel.is_cancelled() {
                self.abandon(runtime, instance).await;
                continue;
            }

            let account = match &pool {
                Some(pool) => match self.lease_account(runtime, pool.as_ref(), instance).await {
                    Some(account) => Some(account),
                    None => {
                        result.error(
                            LaunchPhase::WorkerStart,
                            Some(instance),
                            "no account available to lease",
                        );
                        result.skipped_errors += 1;
                        self.abandon(runtime, instance).await;
                        continue;
                    }
                },
                None => None,
            };

            // Another group may have taken the instance while we slept.
            let still_ours = self
                .registry
                .assignment(instance)
                .await
                .is_some_and(|a| a.group == runtime.name);
            if !still_ours {
                warn!(group = %runtime.name, instance, "instance lost before worker start");
                result.error(
                    LaunchPhase::WorkerStart,
                    Some(instance),
                    "instance taken by another group before its worker started",
                );
                result.skipped_errors += 1;
                if let Some(account) = &account {
                    if let Err(e) = self.store.release_account(account, &runtime.session_id) {
                        warn!(%account, error = %e, "failed to release account lease");
                    }
                }
                continue;
            }

            let executor = RestartExecutor::new(&def.routine, Arc::clone(&routine), def.restart.clone())
                .with_variables(defaults.clone(), def.variables.clone())
                .with_tracking(TrackingHooks::new(
                    Arc::clone(&self.tracker),
                    &runtime.session_id,
                ));

            runtime.running.store(true, Ordering::SeqCst);
            self.spawn_worker(runtime, instance, account, executor).await;
            result.workers_started.push(instance);

            if i + 1 < acquired.len() && !stagger.is_zero() {
                tokio::select! {
                    _ = runtime.cancel.cancelled() => {}
                    _ = tokio::time::sleep(stagger) => {}
                }
            }
        }
    }

    /// Lease the first free account from `pool` not already used in this session.
    async fn lease_account(
        &self,
        runtime: &GroupRuntime,
        pool: &dyn AccountPool,
        instance: InstanceId,
    ) -> Option<String> {
        let in_use: HashSet<String> = runtime
            .workers
            .read()
            .await
            .values()
            .filter_map(|slot| slot.info.account.clone())
            .collect();

        for account in pool.available_accounts() {
            if in_use.contains(&account) {
                continue;
            }
            match self.store.checkout(&account, &runtime.session_id, instance) {
                Ok(_) => return Some(account),
                Err(StateError::LeaseConflict { holder, .. }) => {
                    debug!(%account, %holder, "account leased elsewhere");
                }
                Err(e) => {
                    warn!(%account, instance, error = %e, "account checkout failed");
                }
            }
        }
        None
    }

    /// Give back an acquired instance that never got a worker.
    async fn abandon(&self, runtime: &GroupRuntime, instance: InstanceId) {
        if let Err(e) = self.registry.release(instance, &runtime.name).await {
            warn!(group = %runtime.name, instance, error = %e, "failed to release instance");
        }
        self.health.untrack_instance(instance).await;
    }

    async fn spawn_worker(
        &self,
        runtime: &Arc<GroupRuntime>,
        instance: InstanceId,
        account: Option<String>,
        executor: RestartExecutor,
    ) {
        let cancel = runtime.cancel.child_token();
        let worker_id = worker_id(&runtime.name, instance);

        // An unready instance stops its own worker, nothing else.
        let watched = Arc::clone(runtime);
        let worker_cancel = cancel.clone();
        self.health
            .on_health_change(
                instance,
                Arc::new(move |id: InstanceId, ready: bool| -> BoxFuture {
                    let runtime = Arc::clone(&watched);
                    let cancel = worker_cancel.clone();
                    Box::pin(async move {
                        if !ready && !cancel.is_cancelled() {
                            warn!(group = %runtime.name, instance = id, "instance unhealthy, stopping worker");
                            runtime.set_status(id, WorkerStatus::Stopping).await;
                            cancel.cancel();
                        }
                    })
                }),
            )
            .await;

        // Hold the table until the slot is in place so cleanup can't race it.
        let mut workers = runtime.workers.write().await;

        let mut ctx = RoutineContext::new(instance, account.clone(), cancel.clone());
        let body = tokio::spawn({
            let runtime = Arc::clone(runtime);
            let registry = Arc::clone(&self.registry);
            async move {
                {
                    let mut workers = runtime.workers.write().await;
                    if let Some(slot) = workers.get_mut(&instance) {
                        if slot.info.status == WorkerStatus::Starting {
                            slot.info.status = WorkerStatus::Running;
                        }
                    }
                }
                if let Err(e) = registry.set_running(instance, &runtime.name, true).await {
                    debug!(instance, error = %e, "could not flag instance running");
                }
                executor.run(&mut ctx).await
            }
        });
        let body_abort = body.abort_handle();

        let supervisor = tokio::spawn({
            let this = self.clone();
            let runtime = Arc::clone(runtime);
            let worker_id = worker_id.clone();
            let account = account.clone();
            async move {
                let (status, error) = classify_exit(body.await);
                this.finish_worker(&runtime, instance, worker_id, account, status, error)
                    .await;
            }
        });

        workers.insert(
            instance,
            WorkerSlot {
                info: WorkerInfo {
                    worker_id: worker_id.clone(),
                    instance,
                    account: account.clone(),
                    status: WorkerStatus::Starting,
                    started_at: epoch_secs(),
                    last_error: None,
                },
                cancel,
                handles: Some(WorkerHandles {
                    supervisor,
                    body: body_abort,
                }),
            },
        );
        info!(group = %runtime.name, %worker_id, instance, account = ?account, "worker started");
    }

    /// Cleanup for a finished worker. Runs on every exit path.
    async fn finish_worker(
        &self,
        runtime: &GroupRuntime,
        instance: InstanceId,
        worker_id: String,
        account: Option<String>,
        status: WorkerStatus,
        error: Option<String>,
    ) {
        match (&status, &error) {
            (WorkerStatus::Failed, Some(e)) if e.starts_with("worker panicked") => {
                error!(group = %runtime.name, %worker_id, error = %e, "worker panicked");
            }
            (WorkerStatus::Failed, e) => {
                warn!(group = %runtime.name, %worker_id, error = ?e, "worker failed");
            }
            _ => info!(group = %runtime.name, %worker_id, %status, "worker exited"),
        }

        self.health.untrack_instance(instance).await;

        let remaining = {
            let mut workers = runtime.workers.write().await;
            workers.remove(&instance);
            workers.len()
        };
        runtime
            .record_exit(WorkerExit {
                worker_id,
                instance,
                account: account.clone(),
                status,
                error,
                finished_at: epoch_secs(),
            })
            .await;

        if let Err(e) = self.registry.release(instance, &runtime.name).await {
            warn!(group = %runtime.name, instance, error = %e, "failed to release instance");
        }

        if let Some(account) = &account {
            if let Err(e) = self.store.release_account(account, &runtime.session_id) {
                error!(group = %runtime.name, %account, error = %e, "failed to release account lease");
            }
        }

        if remaining == 0 && runtime.running.swap(false, Ordering::SeqCst) {
            info!(group = %runtime.name, "last worker exited, group no longer running");
        }
    }

    // ── Stop ───────────────────────────────────────────────────────

    /// Stop one worker. Returns false if it wasn't active.
    async fn stop_worker_in(&self, runtime: &GroupRuntime, instance: InstanceId) -> bool {
        let (cancel, handles) = {
            let mut workers = runtime.workers.write().await;
            let Some(slot) = workers.get_mut(&instance) else {
                return false;
            };
            slot.info.status = WorkerStatus::Stopping;
            (slot.cancel.clone(), slot.handles.take())
        };

        cancel.cancel();
        if let Some(handles) = handles {
            let deadline = Instant::now() + self.stop_timeout;
            self.await_worker(&runtime.name, instance, handles, deadline)
                .await;
        }
        true
    }

    /// Wait for a worker's cleanup; abort the body at `deadline`.
    async fn await_worker(
        &self,
        group: &str,
        instance: InstanceId,
        handles: WorkerHandles,
        deadline: Instant,
    ) {
        let WorkerHandles {
            mut supervisor,
            body,
        } = handles;
        if tokio::time::timeout_at(deadline, &mut supervisor)
            .await
            .is_err()
        {
            warn!(%group, instance, "worker did not stop in time, aborting");
            body.abort();
            let _ = supervisor.await;
        }
    }

    /// Stop one worker of a running group.
    pub async fn stop_worker(&self, group: &str, instance: InstanceId) -> SchedulerResult<()> {
        let runtime = self
            .groups
            .read()
            .await
            .get(group)
            .cloned()
            .ok_or_else(|| SchedulerError::GroupNotRunning(group.to_string()))?;

        if !self.stop_worker_in(&runtime, instance).await {
            return Err(SchedulerError::WorkerNotFound {
                group: group.to_string(),
                instance,
            });
        }
        Ok(())
    }

    /// Stop a group: cancel every worker, wait for cleanup (bounded by the
    /// stop timeout), then sweep instances and leases.
    pub async fn stop_group(&self, name: &str) -> SchedulerResult<()> {
        let runtime = self
            .groups
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::GroupNotRunning(name.to_string()))?;

        info!(group = %name, session = %runtime.session_id, "stopping group");
        runtime.cancel.cancel();

        let pending: Vec<(InstanceId, WorkerHandles)> = {
            let mut workers = runtime.workers.write().await;
            workers
                .iter_mut()
                .filter_map(|(&instance, slot)| {
                    slot.info.status = WorkerStatus::Stopping;
                    slot.handles.take().map(|h| (instance, h))
                })
                .collect()
        };

        let deadline = Instant::now() + self.stop_timeout;
        for (instance, handles) in pending {
            self.await_worker(name, instance, handles, deadline).await;
        }

        let released = self.registry.release_all(name).await;
        for &instance in &released {
            self.health.untrack_instance(instance).await;
        }
        let leases = match self.store.release_all_for_session(&runtime.session_id) {
            Ok(n) => n,
            Err(e) => {
                error!(group = %name, error = %e, "failed to release session leases");
                0
            }
        };

        runtime.running.store(false, Ordering::SeqCst);
        {
            let mut groups = self.groups.write().await;
            if groups.get(name).is_some_and(|rt| Arc::ptr_eq(rt, &runtime)) {
                groups.remove(name);
            }
        }

        info!(
            group = %name,
            instances = released.len(),
            leases,
            "group stopped"
        );
        Ok(())
    }

    /// Stop every launched group.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.groups.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop_group(&name).await {
                warn!(group = %name, error = %e, "failed to stop group");
            }
        }
    }

    // ── Status ─────────────────────────────────────────────────────

    pub async fn group_status(&self, name: &str) -> Option<GroupStatus> {
        let runtime = self.groups.read().await.get(name).cloned()?;

        let mut workers: Vec<WorkerInfo> = runtime
            .workers
            .read()
            .await
            .values()
            .map(|slot| slot.info.clone())
            .collect();
        workers.sort_by_key(|w| w.instance);

        let recent_exits = runtime.recent_exits.read().await.iter().cloned().collect();

        Some(GroupStatus {
            name: runtime.name.clone(),
            session_id: runtime.session_id.clone(),
            running: runtime.running.load(Ordering::SeqCst),
            workers,
            recent_exits,
        })
    }

    /// Whether the group is launching or has active workers.
    pub async fn is_running(&self, name: &str) -> bool {
        self.groups
            .read()
            .await
            .get(name)
            .is_some_and(|rt| rt.is_active())
    }

    /// Names of launching or running groups, sorted.
    pub async fn running_groups(&self) -> Vec<String> {
        let groups = self.groups.read().await;
        let mut names: Vec<String> = groups
            .values()
            .filter(|rt| rt.is_active())
            .map(|rt| rt.name.clone())
            .collect();
        names.sort();
        names
    }
}

fn worker_id(group: &str, instance: InstanceId) -> String {
    format!("{group}-{instance}")
}

/// Unique id for one launch of `group`.
fn generate_session_id(group: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let mut hasher = DefaultHasher::new();
    group.hash(&mut hasher);
    epoch_millis().hash(&mut hasher);
    SEQ.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    format!("{group}-{:08x}", hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use async_trait::async_trait;

    use botgrid_core::{DeviceInstance, ExecutionMetrics, RoutineMetadata};

    use super::*;

    struct NoDevices;

    #[async_trait]
    impl DeviceLifecycle for NoDevices {
        async fn discover_instances(&self) -> anyhow::Result<Vec<DeviceInstance>> {
            Ok(Vec::new())
        }
        async fn get_instance(&self, _id: InstanceId) -> anyhow::Result<Option<DeviceInstance>> {
            Ok(None)
        }
        async fn launch_instance(&self, _id: InstanceId) -> anyhow::Result<()> {
            anyhow::bail!("no emulator installed")
        }
        async fn connect_instance(&self, _id: InstanceId) -> anyhow::Result<()> {
            Ok(())
        }
        async fn disconnect_instance(&self, _id: InstanceId) -> anyhow::Result<()> {
            Ok(())
        }
        async fn probe_connection(&self, _id: InstanceId) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    struct Idle;

    #[async_trait]
    impl Routine for Idle {
        async fn execute(&self, _ctx: &mut RoutineContext) -> anyhow::Result<ExecutionMetrics> {
            Ok(ExecutionMetrics::default())
        }
    }

    struct OneRoutine;

    impl RoutineRegistry for OneRoutine {
        fn has(&self, name: &str) -> bool {
            name == "daily"
        }
        fn get(&self, name: &str) -> anyhow::Result<Arc<dyn Routine>> {
            anyhow::ensure!(name == "daily", "unknown routine {name}");
            Ok(Arc::new(Idle))
        }
        fn metadata(&self, _name: &str) -> anyhow::Result<RoutineMetadata> {
            Ok(RoutineMetadata {
                available_variables: BTreeSet::from(["speed".to_string()]),
                ..RoutineMetadata::default()
            })
        }
    }

    struct AllTemplates;

    impl TemplateRegistry for AllTemplates {
        fn has(&self, _name: &str) -> bool {
            true
        }
    }

    fn orchestrator() -> GroupOrchestrator {
        let devices: Arc<dyn DeviceLifecycle> = Arc::new(NoDevices);
        GroupOrchestrator::new(
            StateStore::open_in_memory().unwrap(),
            HealthMonitor::new(devices.clone()),
            devices,
            Arc::new(OneRoutine),
            Arc::new(AllTemplates),
        )
    }

    fn def(name: &str) -> GroupDefinition {
        GroupDefinition::new(name, "daily", vec![0, 1], 1)
    }

    #[tokio::test]
    async fn create_stamps_timestamps_and_rejects_duplicates() {
        let orch = orchestrator();
        let created = orch.create_group(def("farmers")).unwrap();
        assert!(created.created_at > 0);
        assert_eq!(created.created_at, created.updated_at);

        let err = orch.create_group(def("farmers")).unwrap_err();
        assert!(matches!(err, SchedulerError::State(StateError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn create_rejects_invalid_definition() {
        let orch = orchestrator();
        let mut bad = def("farmers");
        bad.worker_count = 0;
        bad.routine.clear();

        match orch.create_group(bad).unwrap_err() {
            SchedulerError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(orch.list_groups().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_keeps_created_at() {
        let orch = orchestrator();
        let created = orch.create_group(def("farmers")).unwrap();

        let mut changed = def("farmers");
        changed.worker_count = 2;
        let updated = orch.update_group(changed).await.unwrap();

        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(orch.get_group("farmers").unwrap().worker_count, 2);
    }

    #[tokio::test]
    async fn update_unknown_group_fails() {
        let orch = orchestrator();
        let err = orch.update_group(def("ghosts")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::GroupNotFound(_)));
    }

    #[tokio::test]
    async fn save_creates_then_updates() {
        let orch = orchestrator();
        orch.save_group(def("farmers")).await.unwrap();

        let mut changed = def("farmers");
        changed.tags = vec!["night".into()];
        orch.save_group(changed).await.unwrap();

        let groups = orch.list_groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].tags, vec!["night".to_string()]);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let orch = orchestrator();
        orch.create_group(def("farmers")).unwrap();
        assert!(orch.delete_group("farmers").await.unwrap());
        assert!(!orch.delete_group("farmers").await.unwrap());
    }

    #[tokio::test]
    async fn launch_unknown_group_is_an_error() {
        let orch = orchestrator();
        let err = orch.launch_group("ghosts", None).await.unwrap_err();
        assert!(matches!(err, SchedulerError::GroupNotFound(_)));
    }

    #[tokio::test]
    async fn invalid_overrides_fail_before_side_effects() {
        let orch = orchestrator();
        orch.create_group(def("farmers")).unwrap();

        let result = orch
            .launch_group_with_overrides(
                "farmers",
                None,
                GroupOverrides {
                    worker_count: Some(5),
                    ..GroupOverrides::default()
                },
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.errors_in(LaunchPhase::Validation).count(), 1);
        assert!(orch.health().tracked_instances().await.is_empty());
        assert!(!orch.is_running("farmers").await);
        assert_eq!(orch.get_group("farmers").unwrap().worker_count, 1);
    }

    #[tokio::test]
    async fn unknown_routine_reported_in_result() {
        let orch = orchestrator();
        let mut group = def("farmers");
        group.routine = "weekly".into();
        orch.create_group(group).unwrap();

        let result = orch.launch_group("farmers", None).await.unwrap();
        assert!(!result.success);
        let errors: Vec<_> = result.errors_in(LaunchPhase::RoutineValidation).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("routine not found"));
        assert!(orch.group_status("farmers").await.is_none());
    }

    #[tokio::test]
    async fn account_pool_without_resolver_fails_launch() {
        let orch = orchestrator();
        let mut group = def("farmers");
        group.account_pool = Some("main".into());
        orch.create_group(group).unwrap();

        let result = orch.launch_group("farmers", None).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.errors_in(LaunchPhase::AccountResolution).count(), 1);
    }

    #[tokio::test]
    async fn failed_instance_launch_is_skipped_not_fatal() {
        let orch = orchestrator();
        orch.create_group(def("farmers")).unwrap();

        let result = orch.launch_group("farmers", None).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.skipped_errors, 2);
        // Both candidates plus the "no instances acquired" summary.
        assert_eq!(result.errors_in(LaunchPhase::Acquisition).count(), 3);
        assert!(orch.health().tracked_instances().await.is_empty());
        orch.health().stop().await;
    }

    #[tokio::test]
    async fn stop_unknown_group_is_an_error() {
        let orch = orchestrator();
        let err = orch.stop_group("ghosts").await.unwrap_err();
        assert!(matches!(err, SchedulerError::GroupNotRunning(_)));
        let err = orch.stop_worker("ghosts", 1).await.unwrap_err();
        assert!(matches!(err, SchedulerError::GroupNotRunning(_)));
    }

    #[test]
    fn session_ids_are_unique_per_launch() {
        let a = generate_session_id("farmers");
        let b = generate_session_id("farmers");
        assert_ne!(a, b);
        assert!(a.starts_with("farmers-"));
    }
}
