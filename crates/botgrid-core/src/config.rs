//! botgrid.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ConflictPolicy, LaunchOptions, RestartPolicy};

/// Default staleness window after which an account lease can be reclaimed.
pub const DEFAULT_LEASE_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Default health poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound on how long a stop waits for a worker to exit.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotgridConfig {
    pub store: Option<StoreConfig>,
    pub health: Option<HealthConfig>,
    pub leases: Option<LeaseConfig>,
    pub launch: Option<LaunchConfig>,
    pub restart: Option<RestartConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the redb file; absent means in-memory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthConfig {
    pub poll_interval: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseConfig {
    pub stale_after: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub readiness_timeout: Option<String>,
    pub stagger_delay: Option<String>,
    pub conflict_policy: Option<String>,
    pub validate_routine: Option<bool>,
    pub stop_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartConfig {
    pub enabled: Option<bool>,
    pub max_retries: Option<i32>,
    pub initial_delay: Option<String>,
    pub max_delay: Option<String>,
    pub backoff_multiplier: Option<f64>,
    pub reset_on_success: Option<bool>,
}

impl BotgridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn store_path(&self) -> Option<&Path> {
        self.store.as_ref()?.path.as_deref()
    }

    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        let raw = self.health.as_ref().and_then(|h| h.poll_interval.as_deref());
        duration_or("health.poll_interval", raw, DEFAULT_POLL_INTERVAL)
    }

    pub fn lease_stale_after(&self) -> Result<Duration, ConfigError> {
        let raw = self.leases.as_ref().and_then(|l| l.stale_after.as_deref());
        duration_or("leases.stale_after", raw, DEFAULT_LEASE_STALE_AFTER)
    }

    pub fn stop_timeout(&self) -> Result<Duration, ConfigError> {
        let raw = self.launch.as_ref().and_then(|l| l.stop_timeout.as_deref());
        duration_or("launch.stop_timeout", raw, DEFAULT_STOP_TIMEOUT)
    }

    /// Default launch options, filled in from the `[launch]` section.
    pub fn launch_options(&self) -> Result<LaunchOptions, ConfigError> {
        let defaults = LaunchOptions::default();
        let Some(launch) = &self.launch else {
            return Ok(defaults);
        };

        let conflict_policy = match launch.conflict_policy.as_deref() {
            Some(raw) => raw
                .parse::<ConflictPolicy>()
                .map_err(|message| ConfigError::InvalidValue {
                    field: "launch.conflict_policy",
                    message,
                })?,
            None => defaults.conflict_policy,
        };

        Ok(LaunchOptions {
            validate_routine: launch.validate_routine.unwrap_or(defaults.validate_routine),
            readiness_timeout: duration_or(
                "launch.readiness_timeout",
                launch.readiness_timeout.as_deref(),
                defaults.readiness_timeout,
            )?,
            stagger_delay: duration_or(
                "launch.stagger_delay",
                launch.stagger_delay.as_deref(),
                defaults.stagger_delay,
            )?,
            conflict_policy,
        })
    }

    /// Default restart policy, filled in from the `[restart]` section.
    pub fn restart_policy(&self) -> Result<RestartPolicy, ConfigError> {
        let defaults = RestartPolicy::default();
        let Some(restart) = &self.restart else {
            return Ok(defaults);
        };

        Ok(RestartPolicy {
            enabled: restart.enabled.unwrap_or(defaults.enabled),
            max_retries: restart.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: duration_or(
                "restart.initial_delay",
                restart.initial_delay.as_deref(),
                defaults.initial_delay,
            )?,
            max_delay: duration_or(
                "restart.max_delay",
                restart.max_delay.as_deref(),
                defaults.max_delay,
            )?,
            backoff_multiplier: restart
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            reset_on_success: restart.reset_on_success.unwrap_or(defaults.reset_on_success),
        })
    }
}

fn duration_or(
    field: &'static str,
    raw: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match raw {
        Some(value) => parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
            field,
            value: value.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parse a duration string like "5s", "500ms", "10m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = BotgridConfig::from_toml_str("").unwrap();
        assert_eq!(config.poll_interval().unwrap(), Duration::from_secs(1));
        assert_eq!(config.lease_stale_after().unwrap(), Duration::from_secs(600));
        assert_eq!(config.launch_options().unwrap(), LaunchOptions::default());
        assert_eq!(config.restart_policy().unwrap(), RestartPolicy::default());
        assert!(config.store_path().is_none());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[store]
path = "/tmp/botgrid.redb"

[health]
poll_interval = "500ms"

[leases]
stale_after = "15m"

[launch]
readiness_timeout = "90s"
stagger_delay = "0s"
conflict_policy = "cancel"
validate_routine = false

[restart]
max_retries = -1
initial_delay = "2s"
max_delay = "2m"
backoff_multiplier = 1.5
"#;
        let config = BotgridConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.store_path(), Some(Path::new("/tmp/botgrid.redb")));
        assert_eq!(config.poll_interval().unwrap(), Duration::from_millis(500));
        assert_eq!(config.lease_stale_after().unwrap(), Duration::from_secs(900));

        let launch = config.launch_options().unwrap();
        assert_eq!(launch.readiness_timeout, Duration::from_secs(90));
        assert_eq!(launch.stagger_delay, Duration::ZERO);
        assert_eq!(launch.conflict_policy, ConflictPolicy::Cancel);
        assert!(!launch.validate_routine);

        let restart = config.restart_policy().unwrap();
        assert!(restart.enabled);
        assert!(restart.is_unlimited());
        assert_eq!(restart.initial_delay, Duration::from_secs(2));
        assert_eq!(restart.max_delay, Duration::from_secs(120));
        assert_eq!(restart.backoff_multiplier, 1.5);
    }

    #[test]
    fn bad_duration_is_reported_with_field() {
        let config = BotgridConfig::from_toml_str("[health]\npoll_interval = \"soon\"").unwrap();
        let err = config.poll_interval().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidDuration { field: "health.poll_interval", .. }
        ));
    }

    #[test]
    fn bad_conflict_policy_is_rejected() {
        let config =
            BotgridConfig::from_toml_str("[launch]\nconflict_policy = \"prompt\"").unwrap();
        assert!(matches!(
            config.launch_options(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botgrid.toml");
        std::fs::write(&path, "[leases]\nstale_after = \"1m\"\n").unwrap();

        let config = BotgridConfig::from_file(&path).unwrap();
        assert_eq!(config.lease_stale_after().unwrap(), Duration::from_secs(60));

        let missing = BotgridConfig::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("later"), None);
    }
}
