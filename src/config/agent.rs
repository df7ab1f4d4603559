use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentConfig {
    /// Registry HTTP endpoint, with or without scheme
    #[serde(default = "default_consul_address")]
    pub consul_address: String,

    /// Watch the whole catalog and coordinate alerts across agents
    #[serde(default)]
    pub global_mode: bool,

    /// Register demo services on startup, deregister them on shutdown
    #[serde(default)]
    pub dev_mode: bool,

    /// Consecutive matching observations required to confirm a change.
    /// Kept signed so that negative values are reported as such.
    #[serde(default = "default_change_threshold")]
    pub change_threshold: i64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identity of this agent among its peers; names lock sessions
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            consul_address: default_consul_address(),
            global_mode: false,
            dev_mode: false,
            change_threshold: default_change_threshold(),
            log_level: default_log_level(),
            agent_id: default_agent_id(),
        }
    }
}

impl AgentConfig {
    /// # Errors
    /// Returns `Error::InvalidConfig` when:
    /// - the registry address is empty
    /// - the change threshold is zero or negative
    /// - the log level is not a known tracing level
    /// - the agent id is empty
    pub fn validate(&self) -> Result<()> {
        if self.consul_address.trim().is_empty() {
            return Err(Error::InvalidConfig("consul_address cannot be empty".into()));
        }

        if self.change_threshold < 1 {
            return Err(Error::InvalidConfig(format!(
                "change_threshold must be >= 1, got {}",
                self.change_threshold
            )));
        }

        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(Error::InvalidConfig(format!(
                "unknown log_level '{}'",
                self.log_level
            )));
        }

        if self.agent_id.trim().is_empty() {
            return Err(Error::InvalidConfig("agent_id cannot be empty".into()));
        }

        Ok(())
    }

    /// Base URL of the registry HTTP API, always with a scheme and without
    /// a trailing slash.
    pub fn consul_url(&self) -> String {
        let address = self.consul_address.trim().trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        }
    }
}

fn default_consul_address() -> String {
    "127.0.0.1:8500".to_string()
}
fn default_change_threshold() -> i64 {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_agent_id() -> String {
    format!("consul-alerting-{}", nanoid::nanoid!(8))
}
