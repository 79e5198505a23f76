//! Device lifecycle collaborator.
//!
//! The transport that actually finds emulator windows and drives their
//! control channel lives outside BotGrid. The health monitor and the
//! orchestrator only see it through [`DeviceLifecycle`].

use async_trait::async_trait;

use crate::types::InstanceId;

/// What the device layer currently knows about one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInstance {
    pub id: InstanceId,
    /// The instance's window/surface was found.
    pub surface_detected: bool,
    /// The control channel is connected.
    pub connected: bool,
}

impl DeviceInstance {
    /// Both readiness signals hold.
    pub fn is_ready(&self) -> bool {
        self.surface_detected && self.connected
    }
}

/// Start, stop, and probe device instances. Every call may fail.
#[async_trait]
pub trait DeviceLifecycle: Send + Sync {
    /// Enumerate instances whose surface is currently present.
    async fn discover_instances(&self) -> anyhow::Result<Vec<DeviceInstance>>;

    /// Look up a single instance; `None` if it does not exist right now.
    async fn get_instance(&self, id: InstanceId) -> anyhow::Result<Option<DeviceInstance>>;

    /// Ask the device layer to boot the instance.
    async fn launch_instance(&self, id: InstanceId) -> anyhow::Result<()>;

    /// Open the control channel to the instance.
    async fn connect_instance(&self, id: InstanceId) -> anyhow::Result<()>;

    /// Close the control channel to the instance.
    async fn disconnect_instance(&self, id: InstanceId) -> anyhow::Result<()>;

    /// Check whether the control channel currently answers.
    async fn probe_connection(&self, id: InstanceId) -> anyhow::Result<bool>;
}
