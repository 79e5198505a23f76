//! Shared fakes for the orchestrator scenario tests.
//!
//! Every collaborator is in-process: a device fleet backed by a map, routines
//! scripted per test, and an account pool over a fixed list.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use botgrid_core::{
    AccountPool, AccountPoolResolver, BotgridConfig, DeviceInstance, DeviceLifecycle,
    ExecutionMetrics, InstanceId, Routine, RoutineContext, RoutineMetadata, RoutineRegistry,
    TemplateRegistry,
};
use botgrid_health::HealthMonitor;
use botgrid_scheduler::{GroupOrchestrator, WorkerStatus};
use botgrid_state::StateStore;

// ── Tracing setup ────────────────────────────────────────────────

static TRACING_INIT: Once = Once::new();

/// Install a test subscriber once. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,botgrid=debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── Device fleet ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct DeviceState {
    surface: bool,
    connected: bool,
}

/// Emulator fleet. Launch brings the surface up, connect brings the
/// control channel up, unless the instance is marked otherwise.
#[derive(Default)]
pub struct FakeFleet {
    devices: Mutex<HashMap<InstanceId, DeviceState>>,
    unlaunchable: Mutex<HashSet<InstanceId>>,
    unconnectable: Mutex<HashSet<InstanceId>>,
    launches: Mutex<Vec<InstanceId>>,
}

impl FakeFleet {
    /// Instances that are already up and connected.
    pub fn with_ready(ids: &[InstanceId]) -> Arc<Self> {
        let fleet = Self::default();
        {
            let mut devices = fleet.devices.lock().unwrap();
            for &id in ids {
                devices.insert(
                    id,
                    DeviceState {
                        surface: true,
                        connected: true,
                    },
                );
            }
        }
        Arc::new(fleet)
    }

    pub fn set_connected(&self, id: InstanceId, connected: bool) {
        self.devices.lock().unwrap().entry(id).or_default().connected = connected;
    }

    pub fn make_unlaunchable(&self, id: InstanceId) {
        self.unlaunchable.lock().unwrap().insert(id);
    }

    pub fn make_unconnectable(&self, id: InstanceId) {
        self.unconnectable.lock().unwrap().insert(id);
    }

    pub fn launches(&self) -> Vec<InstanceId> {
        self.launches.lock().unwrap().clone()
    }

    fn snapshot(&self, id: InstanceId) -> Option<DeviceInstance> {
        self.devices.lock().unwrap().get(&id).map(|d| DeviceInstance {
            id,
            surface_detected: d.surface,
            connected: d.connected,
        })
    }
}

#[async_trait]
impl DeviceLifecycle for FakeFleet {
    async fn discover_instances(&self) -> anyhow::Result<Vec<DeviceInstance>> {
        let devices = self.devices.lock().unwrap();
        Ok(devices
            .iter()
            .filter(|(_, d)| d.surface)
            .map(|(&id, d)| DeviceInstance {
                id,
                surface_detected: d.surface,
                connected: d.connected,
            })
            .collect())
    }

    async fn get_instance(&self, id: InstanceId) -> anyhow::Result<Option<DeviceInstance>> {
        Ok(self.snapshot(id))
    }

    async fn launch_instance(&self, id: InstanceId) -> anyhow::Result<()> {
        if self.unlaunchable.lock().unwrap().contains(&id) {
            anyhow::bail!("emulator {id} failed to boot");
        }
        self.launches.lock().unwrap().push(id);
        self.devices.lock().unwrap().entry(id).or_default().surface = true;
        Ok(())
    }

    async fn connect_instance(&self, id: InstanceId) -> anyhow::Result<()> {
        if self.unconnectable.lock().unwrap().contains(&id) {
            anyhow::bail!("adb connect {id} refused");
        }
        self.devices.lock().unwrap().entry(id).or_default().connected = true;
        Ok(())
    }

    async fn disconnect_instance(&self, id: InstanceId) -> anyhow::Result<()> {
        self.set_connected(id, false);
        Ok(())
    }

    async fn probe_connection(&self, id: InstanceId) -> anyhow::Result<bool> {
        Ok(self.snapshot(id).is_some_and(|d| d.connected))
    }
}

// ── Routines ─────────────────────────────────────────────────────

/// Runs until its worker is cancelled.
pub struct UntilCancelled;

#[async_trait]
impl Routine for UntilCancelled {
    async fn execute(&self, ctx: &mut RoutineContext) -> anyhow::Result<ExecutionMetrics> {
        ctx.cancel.cancelled().await;
        Ok(ExecutionMetrics {
            actions: 1,
            ..ExecutionMetrics::default()
        })
    }
}

/// Ignores cancellation entirely.
pub struct Stubborn;

#[async_trait]
impl Routine for Stubborn {
    async fn execute(&self, _ctx: &mut RoutineContext) -> anyhow::Result<ExecutionMetrics> {
        std::future::pending::<()>().await;
        Ok(ExecutionMetrics::default())
    }
}

/// Fails every run, recording when each run started.
#[derive(Default)]
pub struct AlwaysFails {
    pub started: Mutex<Vec<Instant>>,
}

impl AlwaysFails {
    pub fn gaps(&self) -> Vec<Duration> {
        let started = self.started.lock().unwrap();
        started.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl Routine for AlwaysFails {
    async fn execute(&self, _ctx: &mut RoutineContext) -> anyhow::Result<ExecutionMetrics> {
        self.started.lock().unwrap().push(Instant::now());
        anyhow::bail!("could not find the start button")
    }
}

/// Panics on its first run.
pub struct Panics;

#[async_trait]
impl Routine for Panics {
    async fn execute(&self, _ctx: &mut RoutineContext) -> anyhow::Result<ExecutionMetrics> {
        panic!("template matcher crashed");
    }
}

/// Name → routine, with empty metadata.
#[derive(Default)]
pub struct RoutineBook {
    routines: HashMap<String, Arc<dyn Routine>>,
}

impl RoutineBook {
    pub fn with(mut self, name: &str, routine: Arc<dyn Routine>) -> Self {
        self.routines.insert(name.to_string(), routine);
        self
    }
}

impl RoutineRegistry for RoutineBook {
    fn has(&self, name: &str) -> bool {
        self.routines.contains_key(name)
    }

    fn get(&self, name: &str) -> anyhow::Result<Arc<dyn Routine>> {
        self.routines
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("routine {name} not registered"))
    }

    fn metadata(&self, _name: &str) -> anyhow::Result<RoutineMetadata> {
        Ok(RoutineMetadata::default())
    }
}

pub struct AnyTemplate;

impl TemplateRegistry for AnyTemplate {
    fn has(&self, _name: &str) -> bool {
        true
    }
}

// ── Accounts ─────────────────────────────────────────────────────

pub struct FixedPool(pub Vec<String>);

#[async_trait]
impl AccountPool for FixedPool {
    fn stats(&self) -> botgrid_core::PoolStats {
        botgrid_core::PoolStats {
            total: self.0.len(),
            available: self.0.len(),
        }
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn available_accounts(&self) -> Vec<String> {
        self.0.clone()
    }
}

/// Resolves exactly one pool name.
pub struct OnePool {
    pub name: String,
    pub pool: Arc<FixedPool>,
}

#[async_trait]
impl AccountPoolResolver for OnePool {
    async fn resolve(&self, pool_name: &str) -> anyhow::Result<Arc<dyn AccountPool>> {
        anyhow::ensure!(pool_name == self.name, "unknown account pool {pool_name}");
        Ok(self.pool.clone())
    }
}

pub fn accounts(pool: &str, names: &[&str]) -> Arc<OnePool> {
    Arc::new(OnePool {
        name: pool.to_string(),
        pool: Arc::new(FixedPool(names.iter().map(|s| s.to_string()).collect())),
    })
}

// ── Harness ──────────────────────────────────────────────────────

const TEST_CONFIG: &str = r#"
[health]
poll_interval = "1s"

[launch]
readiness_timeout = "5s"
stagger_delay = "2s"
stop_timeout = "5s"
"#;

pub struct Harness {
    pub fleet: Arc<FakeFleet>,
    pub orch: GroupOrchestrator,
}

impl Harness {
    pub fn new(fleet: Arc<FakeFleet>, routines: RoutineBook) -> Self {
        init_tracing();
        let config = BotgridConfig::from_toml_str(TEST_CONFIG).unwrap();

        let store = StateStore::open_in_memory().unwrap();
        let health = HealthMonitor::with_interval(fleet.clone(), config.poll_interval().unwrap());
        let orch = GroupOrchestrator::new(
            store,
            health,
            fleet.clone(),
            Arc::new(routines),
            Arc::new(AnyTemplate),
        )
        .with_stop_timeout(config.stop_timeout().unwrap());

        Self { fleet, orch }
    }

    pub fn with_pools(mut self, resolver: Arc<dyn AccountPoolResolver>) -> Self {
        self.orch = self.orch.with_account_pools(resolver);
        self
    }

    pub fn launch_options(&self) -> botgrid_core::LaunchOptions {
        BotgridConfig::from_toml_str(TEST_CONFIG)
            .unwrap()
            .launch_options()
            .unwrap()
    }
}

/// Poll `check` every 100ms (virtual time) until it holds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not met within 120s");
}

/// Wait until `group` has `count` workers whose routines have started.
pub async fn workers_running(orch: &GroupOrchestrator, group: &str, count: usize) {
    eventually(|| async {
        orch.group_status(group).await.is_some_and(|status| {
            status.workers.len() == count
                && status.workers.iter().all(|w| w.status == WorkerStatus::Running)
        })
    })
    .await;
}
