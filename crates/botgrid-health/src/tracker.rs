//! Per-instance health state.
//!
//! Folds each poll's two readiness signals into a status record and
//! reports when the derived `ready` flag flips.

use tracing::{debug, warn};

use botgrid_core::InstanceId;

/// Health of a single tracked instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHealthStatus {
    pub instance: InstanceId,
    /// The instance's window/surface was found on the last poll.
    pub surface_detected: bool,
    /// The control channel answered on the last poll.
    pub connected: bool,
    /// `surface_detected && connected`.
    pub ready: bool,
    /// Unix timestamp (milliseconds) of the last poll; 0 = never checked.
    pub last_check_ms: u64,
    /// Unready observations in a row. Reset on the first ready one.
    pub consecutive_failures: u32,
}

impl InstanceHealthStatus {
    /// Fresh, never-checked status. Starts unready.
    pub fn new(instance: InstanceId) -> Self {
        Self {
            instance,
            surface_detected: false,
            connected: false,
            ready: false,
            last_check_ms: 0,
            consecutive_failures: 0,
        }
    }

    /// Record one poll. Returns the new `ready` value if it changed.
    pub fn record(&mut self, surface_detected: bool, connected: bool, now_ms: u64) -> Option<bool> {
        let was_ready = self.ready;

        self.surface_detected = surface_detected;
        self.connected = connected;
        self.ready = surface_detected && connected;
        self.last_check_ms = now_ms;

        if self.ready {
            if self.consecutive_failures > 0 {
                debug!(
                    instance = self.instance,
                    failures = self.consecutive_failures,
                    "instance recovered"
                );
            }
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }

        match (was_ready, self.ready) {
            (false, true) => Some(true),
            (true, false) => {
                warn!(
                    instance = self.instance,
                    surface_detected, connected, "instance became unready"
                );
                Some(false)
            }
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }
}
