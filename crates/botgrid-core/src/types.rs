//! Core policy types shared by the registry, executor, and orchestrator.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifier of one controllable device instance.
///
/// Signed because ids arrive from user-authored group definitions and
/// negative values must be reportable as validation errors.
pub type InstanceId = i32;

/// Sentinel for `RestartPolicy::max_retries` meaning "retry forever".
pub const UNLIMITED_RETRIES: i32 = -1;

// ── Conflict resolution ────────────────────────────────────────────

/// What to do when a candidate instance is owned by another group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Stop the other group's worker on the instance, then take it.
    Cancel,
    /// Move on to the next candidate.
    #[default]
    Skip,
    /// Stop acquiring; keep what was already acquired.
    Abort,
    /// Caller decides before launch; treated as `Skip` at launch time.
    Ask,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictPolicy::Cancel => "cancel",
            ConflictPolicy::Skip => "skip",
            ConflictPolicy::Abort => "abort",
            ConflictPolicy::Ask => "ask",
        };
        f.write_str(s)
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cancel" => Ok(ConflictPolicy::Cancel),
            "skip" => Ok(ConflictPolicy::Skip),
            "abort" => Ok(ConflictPolicy::Abort),
            "ask" => Ok(ConflictPolicy::Ask),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

// ── Restart policy ─────────────────────────────────────────────────

/// Governs how one worker's routine is re-run after success or failure.
///
/// The retry delay for retry `k` (0-indexed) is
/// `min(max_delay, initial_delay × backoff_multiplier^k)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub enabled: bool,
    /// Maximum consecutive retries. `-1` or `0` = unlimited.
    pub max_retries: i32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Zero the retry counter (and delay) after a successful run.
    pub reset_on_success: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            reset_on_success: true,
        }
    }
}

impl RestartPolicy {
    /// A policy that runs the routine exactly once.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Whether retries are unbounded.
    pub fn is_unlimited(&self) -> bool {
        self.max_retries <= 0
    }

    /// Whether `retries` consecutive retries exhaust the budget.
    pub fn exhausted(&self, retries: u32) -> bool {
        !self.is_unlimited() && retries >= self.max_retries as u32
    }

    /// Backoff delay for the given retry number (0-indexed), clamped to `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

// ── Launch options ─────────────────────────────────────────────────

/// Per-launch knobs for instance acquisition and worker start-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Check routine, templates, and variables before acquiring instances.
    pub validate_routine: bool,
    /// How long to wait for each instance to become ready.
    pub readiness_timeout: Duration,
    /// Delay between consecutive worker starts.
    pub stagger_delay: Duration,
    pub conflict_policy: ConflictPolicy,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            validate_routine: true,
            readiness_timeout: Duration::from_secs(60),
            stagger_delay: Duration::from_secs(2),
            conflict_policy: ConflictPolicy::Skip,
        }
    }
}
