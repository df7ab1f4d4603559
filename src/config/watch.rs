use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::HealthState;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Upper bound of a single blocking query (unit: milliseconds)
    #[serde(default = "default_wait_time_ms")]
    pub wait_time_ms: u64,

    /// A run of registry errors longer than this is reported as persistent
    /// (unit: milliseconds). The loop keeps retrying regardless.
    #[serde(default = "default_error_ceiling_ms")]
    pub error_ceiling_ms: u64,

    /// Per handler delivery timeout (unit: milliseconds)
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    /// Prior confirmed state assumed for every entity. When unset the first
    /// observation becomes the baseline and never alerts.
    #[serde(default)]
    pub seed_state: Option<HealthState>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            wait_time_ms: default_wait_time_ms(),
            error_ceiling_ms: default_error_ceiling_ms(),
            handler_timeout_ms: default_handler_timeout_ms(),
            seed_state: None,
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.wait_time_ms == 0 {
            return Err(Error::InvalidConfig("watch.wait_time_ms cannot be 0".into()));
        }
        if self.handler_timeout_ms == 0 {
            return Err(Error::InvalidConfig("watch.handler_timeout_ms cannot be 0".into()));
        }
        Ok(())
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    pub fn error_ceiling(&self) -> Duration {
        Duration::from_millis(self.error_ceiling_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LockConfig {
    /// KV prefix under which lock keys are created
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Session TTL backing every held lock (unit: milliseconds)
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// How often a held lock is renewed (unit: milliseconds)
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            ttl_ms: default_ttl_ms(),
            renew_interval_ms: default_renew_interval_ms(),
        }
    }
}

impl LockConfig {
    /// # Errors
    /// Returns `Error::InvalidConfig` when the prefix is empty or the renewal
    /// interval would let the session expire between renewals.
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.trim_matches('/').is_empty() {
            return Err(Error::InvalidConfig("lock.key_prefix cannot be empty".into()));
        }
        if self.ttl_ms == 0 {
            return Err(Error::InvalidConfig("lock.ttl_ms cannot be 0".into()));
        }
        if self.renew_interval_ms == 0 || self.renew_interval_ms >= self.ttl_ms {
            return Err(Error::InvalidConfig(format!(
                "lock.renew_interval_ms ({}) must be in 1..{}",
                self.renew_interval_ms, self.ttl_ms
            )));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }
}

/// A watch that is dispatching when shutdown starts finishes that dispatch
/// before it stops, so the grace period must outlast one handler timeout.
/// A dispatch to several slow handlers can still run past it; such a watch
/// is aborted and its lock left to the final sweep.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ShutdownConfig {
    /// Time granted to watch loops to stop and release their locks
    /// (unit: milliseconds)
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl ShutdownConfig {
    /// # Errors
    /// Returns `Error::InvalidConfig` when the grace period does not leave
    /// room for one handler to time out.
    pub fn validate(
        &self,
        watch: &WatchConfig,
    ) -> Result<()> {
        if self.grace_period_ms <= watch.handler_timeout_ms {
            return Err(Error::InvalidConfig(format!(
                "shutdown.grace_period_ms ({}) must exceed watch.handler_timeout_ms ({})",
                self.grace_period_ms, watch.handler_timeout_ms
            )));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

fn default_wait_time_ms() -> u64 {
    30_000
}
fn default_error_ceiling_ms() -> u64 {
    60_000
}
fn default_handler_timeout_ms() -> u64 {
    10_000
}
fn default_key_prefix() -> String {
    "consul-alerting/lock".to_string()
}
fn default_ttl_ms() -> u64 {
    15_000
}
fn default_renew_interval_ms() -> u64 {
    5_000
}
fn default_grace_period_ms() -> u64 {
    15_000
}
