use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Basic retry policy template
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Maximum number of attempts (0 means unlimited retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Single operation timeout (unit: milliseconds)
    #[serde(default = "default_op_timeout_ms")]
    pub timeout_ms: u64,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_ms: default_op_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Divide strategies by operation
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryPolicies {
    // Watch loop blocking queries. Only the delays are used: the loop
    // retries forever and the query itself is bounded by the wait time.
    #[serde(default = "default_registry_policy")]
    pub registry: BackoffPolicy,

    // Lock acquisition on a confirmed transition (bounded retry)
    #[serde(default = "default_lock_policy")]
    pub lock: BackoffPolicy,

    // Startup connectivity probe; exhaustion aborts the process
    #[serde(default = "default_startup_policy")]
    pub startup: BackoffPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            registry: default_registry_policy(),
            lock: default_lock_policy(),
            startup: default_startup_policy(),
        }
    }
}

fn default_registry_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 0,
        timeout_ms: 5_000,
        base_delay_ms: 1_000,
        max_delay_ms: 30_000,
    }
}
fn default_lock_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 3,
        timeout_ms: 2_000,
        base_delay_ms: 200,
        max_delay_ms: 2_000,
    }
}
fn default_startup_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 30,
        timeout_ms: 5_000,
        base_delay_ms: 10_000,
        max_delay_ms: 10_000,
    }
}
fn default_max_retries() -> usize {
    3
}
fn default_op_timeout_ms() -> u64 {
    1_000
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5_000
}
