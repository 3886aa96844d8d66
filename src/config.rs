// src/config.rs

//! Manages coordinator configuration: loading, defaults, and validation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// The top-level configuration for the coordinator process, loaded from a
/// TOML file at startup.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Default tracing filter, overridable via `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Defaults applied to every newly created formation.
    #[serde(default)]
    pub formation_defaults: FormationDefaults,
}

/// Lag thresholds and timers seeded into new formation rows. All of them
/// are formation-scoped at runtime; these are only the starting values.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormationDefaults {
    /// A standby within this many bytes of the primary may enable
    /// synchronous replication.
    #[serde(default = "default_enable_sync_lag_threshold")]
    pub enable_sync_lag_threshold: u64,

    /// A standby within this many bytes of the primary may be promoted.
    #[serde(default = "default_promote_lag_threshold")]
    pub promote_lag_threshold: u64,

    /// How long a demoting primary is given to self-fence.
    #[serde(with = "humantime_serde", default = "default_drain_timeout")]
    pub drain_timeout: Duration,

    /// How long a node may stay silent before its failed health checks count.
    #[serde(with = "humantime_serde", default = "default_unhealthy_timeout")]
    pub unhealthy_timeout: Duration,

    /// Window after coordinator start during which health checks are not
    /// trusted, so that a restart does not trigger spurious failovers.
    #[serde(with = "humantime_serde", default = "default_startup_grace")]
    pub startup_grace: Duration,
}

impl Default for FormationDefaults {
    fn default() -> Self {
        Self {
            enable_sync_lag_threshold: default_enable_sync_lag_threshold(),
            promote_lag_threshold: default_promote_lag_threshold(),
            drain_timeout: default_drain_timeout(),
            unhealthy_timeout: default_unhealthy_timeout(),
            startup_grace: default_startup_grace(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            formation_defaults: FormationDefaults::default(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6432
}

fn default_log_level() -> String {
    "info,steward::core=debug".to_string()
}

/// 16MB, one WAL segment: the default for both lag thresholds.
fn default_enable_sync_lag_threshold() -> u64 {
    16 * 1024 * 1024
}

fn default_promote_lag_threshold() -> u64 {
    16 * 1024 * 1024
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_unhealthy_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_startup_grace() -> Duration {
    Duration::from_secs(10)
}

impl Config {
    /// Loads the configuration from the given TOML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("could not read configuration file \"{path}\""))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("could not parse configuration file \"{path}\""))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the coordinator cannot safely run with.
    pub fn validate(&self) -> Result<()> {
        if self.formation_defaults.drain_timeout.is_zero() {
            anyhow::bail!("drain_timeout must be greater than zero");
        }
        if self.formation_defaults.unhealthy_timeout.is_zero() {
            anyhow::bail!("unhealthy_timeout must be greater than zero");
        }
        Ok(())
    }
}
