//! Health monitor: background poll loop for tracked instances.
//!
//! The `HealthMonitor` runs a single background task that, once per
//! poll period, refreshes the readiness signals of every tracked
//! instance and then notifies waiters and callbacks about transitions.
//! State mutation and notification are two separate passes so that a
//! callback re-entering the monitor can never deadlock on its tables.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use botgrid_core::config::DEFAULT_POLL_INTERVAL;
use botgrid_core::{DeviceInstance, DeviceLifecycle, InstanceId};

use crate::error::{HealthError, HealthResult};
use crate::tracker::InstanceHealthStatus;

/// Callback invoked when an instance's `ready` flag changes.
///
/// Receives the instance id and the new readiness. Each invocation runs
/// on its own task.
pub type HealthCallback = Arc<dyn Fn(InstanceId, bool) -> BoxFuture + Send + Sync>;

pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// One tracked instance.
struct TrackedInstance {
    status: InstanceHealthStatus,
    /// Latest readiness; waiters subscribe to it. Dropped on untrack.
    ready_tx: Arc<watch::Sender<bool>>,
}

impl TrackedInstance {
    fn new(instance: InstanceId) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            status: InstanceHealthStatus::new(instance),
            ready_tx: Arc::new(ready_tx),
        }
    }
}

struct Inner {
    devices: Arc<dyn DeviceLifecycle>,
    interval: Duration,
    /// Health-tracking table: instance → status.
    tracked: RwLock<HashMap<InstanceId, TrackedInstance>>,
    /// Callback table: instance → listeners.
    callbacks: RwLock<HashMap<InstanceId, Vec<HealthCallback>>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Tracks readiness for the instances currently referenced by launches.
///
/// Cheap to clone; clones share the same tables and poll loop.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    /// Create a monitor with the default 1s poll period. Call [`start`](Self::start) to begin polling.
    pub fn new(devices: Arc<dyn DeviceLifecycle>) -> Self {
        Self::with_interval(devices, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(devices: Arc<dyn DeviceLifecycle>, interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                devices,
                interval,
                tracked: RwLock::new(HashMap::new()),
                callbacks: RwLock::new(HashMap::new()),
                shutdown_tx,
                handle: Mutex::new(None),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Spawn the poll loop. No-op if it is already running.
    pub async fn start(&self) {
        let mut handle = self.inner.handle.lock().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        self.inner.shutdown_tx.send_replace(false);
        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(run_poll_loop(inner, shutdown)));

        info!(interval = ?self.inner.interval, "health monitor started");
    }

    /// Stop the poll loop and release every waiter and callback.
    pub async fn stop(&self) {
        self.inner.shutdown_tx.send_replace(true);
        if let Some(handle) = self.inner.handle.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.tracked.write().await.clear();
        self.inner.callbacks.write().await.clear();
        info!("health monitor stopped");
    }

    pub async fn is_running(&self) -> bool {
        let handle = self.inner.handle.lock().await;
        handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start tracking an instance. Idempotent.
    pub async fn track_instance(&self, instance: InstanceId) {
        let mut tracked = self.inner.tracked.write().await;
        if !tracked.contains_key(&instance) {
            tracked.insert(instance, TrackedInstance::new(instance));
            debug!(instance, "instance tracked");
        }
    }

    /// Stop tracking an instance. Idempotent.
    ///
    /// Pending waiters return [`HealthError::Untracked`] and the instance's
    /// callbacks are dropped.
    pub async fn untrack_instance(&self, instance: InstanceId) {
        let removed = self.inner.tracked.write().await.remove(&instance).is_some();
        self.inner.callbacks.write().await.remove(&instance);
        if removed {
            debug!(instance, "instance untracked");
        }
    }

    /// Register a callback for every ready/unready transition of `instance`.
    pub async fn on_health_change(&self, instance: InstanceId, callback: HealthCallback) {
        self.inner
            .callbacks
            .write()
            .await
            .entry(instance)
            .or_default()
            .push(callback);
    }

    /// Wait until `instance` is ready.
    ///
    /// Returns immediately if it already is. Fails on timeout, if the
    /// instance is untracked meanwhile, or if the monitor stops.
    pub async fn wait_for_ready(&self, instance: InstanceId, timeout: Duration) -> HealthResult<()> {
        let mut ready_rx = {
            let tracked = self.inner.tracked.read().await;
            tracked
                .get(&instance)
                .ok_or(HealthError::NotTracked(instance))?
                .ready_tx
                .subscribe()
        };
        if *ready_rx.borrow_and_update() {
            return Ok(());
        }

        let mut shutdown = self.inner.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(HealthError::MonitorStopped);
        }

        tokio::select! {
            biased;
            _ = async { let _ = shutdown.wait_for(|stopped| *stopped).await; } => {
                Err(HealthError::MonitorStopped)
            }
            res = async { ready_rx.wait_for(|ready| *ready).await.map(|_| ()) } => {
                res.map_err(|_| HealthError::Untracked(instance))
            }
            _ = tokio::time::sleep(timeout) => Err(HealthError::Timeout { instance, timeout }),
        }
    }

    /// Snapshot of an instance's health.
    pub async fn status(&self, instance: InstanceId) -> Option<InstanceHealthStatus> {
        let tracked = self.inner.tracked.read().await;
        tracked.get(&instance).map(|t| t.status.clone())
    }

    pub async fn is_ready(&self, instance: InstanceId) -> bool {
        let tracked = self.inner.tracked.read().await;
        tracked.get(&instance).is_some_and(|t| t.status.ready)
    }

    /// Ids of all tracked instances, sorted.
    pub async fn tracked_instances(&self) -> Vec<InstanceId> {
        let tracked = self.inner.tracked.read().await;
        let mut ids: Vec<_> = tracked.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Run one poll immediately (outside the loop's schedule).
    pub async fn check_now(&self) {
        poll_once(&self.inner).await;
    }
}

/// The poll loop: tick, check, repeat until shutdown.
async fn run_poll_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => poll_once(&inner).await,
            _ = async { let _ = shutdown.wait_for(|stopped| *stopped).await; } => {
                debug!("health loop shutting down");
                break;
            }
        }
    }
}

/// One health check pass over every tracked instance.
async fn poll_once(inner: &Inner) {
    let ids: Vec<InstanceId> = inner.tracked.read().await.keys().copied().collect();
    if ids.is_empty() {
        return;
    }

    // Probe the device layer without holding any table lock.
    let discovered: Option<HashMap<InstanceId, DeviceInstance>> =
        match inner.devices.discover_instances().await {
            Ok(list) => Some(list.into_iter().map(|d| (d.id, d)).collect()),
            Err(e) => {
                warn!(error = %e, "instance discovery failed, probing individually");
                None
            }
        };

    let mut observations = Vec::with_capacity(ids.len());
    for id in ids {
        let surface_detected = match &discovered {
            Some(found) => found.get(&id).is_some_and(|d| d.surface_detected),
            None => match inner.devices.get_instance(id).await {
                Ok(found) => found.is_some_and(|d| d.surface_detected),
                Err(e) => {
                    debug!(instance = id, error = %e, "instance lookup failed");
                    false
                }
            },
        };
        let connected = match inner.devices.probe_connection(id).await {
            Ok(connected) => connected,
            Err(e) => {
                debug!(instance = id, error = %e, "connection probe failed");
                false
            }
        };
        observations.push((id, surface_detected, connected));
    }

    // Pass 1: mutate state, collect transitions.
    let now = epoch_millis();
    let mut transitions = Vec::new();
    {
        let mut tracked = inner.tracked.write().await;
        for (id, surface_detected, connected) in observations {
            // Untracked while we were probing.
            let Some(entry) = tracked.get_mut(&id) else {
                continue;
            };
            if let Some(ready) = entry.status.record(surface_detected, connected, now) {
                transitions.push((id, ready, Arc::clone(&entry.ready_tx)));
            }
        }
    }

    // Pass 2: notify with no lock held.
    for (id, ready, ready_tx) in transitions {
        ready_tx.send_replace(ready);
        info!(instance = id, ready, "instance health changed");

        let listeners = inner
            .callbacks
            .read()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default();
        for callback in listeners {
            tokio::spawn(callback(id, ready));
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
