//! Configuration management for the alerting agent.
//!
//! Settings are merged from several sources with priority:
//! 1. Default values (hardcoded)
//! 2. The config file passed on the command line (TOML)
//! 3. Environment variables prefixed with `ALERTING__` (highest priority)
//!
//! Everything is validated once at startup. Watch loops only ever see
//! settings that already passed [`Settings::validate`].

mod agent;
mod handlers;
mod monitoring;
mod retry;
mod services;
mod watch;
pub use agent::*;
pub use handlers::*;
pub use monitoring::*;
pub use retry::*;
pub use services::*;
pub use watch::*;


//---
use std::collections::HashMap;
use std::collections::HashSet;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::ChangeThreshold;
use crate::Error;
use crate::Result;

/// Environment variable prefix, e.g. `ALERTING__AGENT__GLOBAL_MODE=true`
pub const ENV_PREFIX: &str = "ALERTING";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// Agent identity, registry endpoint and operating mode
    #[serde(default)]
    pub agent: AgentConfig,
    /// Blocking query and dispatch parameters
    #[serde(default)]
    pub watch: WatchConfig,
    /// Fleet-wide lock parameters
    #[serde(default)]
    pub lock: LockConfig,
    /// Retry policies for registry operations
    #[serde(default)]
    pub retry: RetryPolicies,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// Metrics and monitoring settings
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Per-service overrides keyed by service name
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    /// Notification handlers, in dispatch order
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and environment
    /// variables, then validate the result.
    ///
    /// # Arguments
    /// * `path` - Optional path to the config file. A missing file is an
    ///   error when a path is given.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates every section and the cross references between services
    /// and handlers.
    pub fn validate(&self) -> Result<()> {
        self.agent.validate()?;
        self.watch.validate()?;
        self.lock.validate()?;
        self.shutdown.validate(&self.watch)?;
        self.monitoring.validate()?;

        let mut names = HashSet::new();
        for handler in &self.handlers {
            handler.validate()?;
            if !names.insert(handler.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate handler name '{}'",
                    handler.name
                )));
            }
        }

        for (service, config) in &self.services {
            config.validate(service)?;
            if let Some(selected) = &config.handlers {
                for name in selected {
                    if !names.contains(name.as_str()) {
                        return Err(Error::InvalidConfig(format!(
                            "service '{}' references unknown handler '{}'",
                            service, name
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn service(
        &self,
        name: &str,
    ) -> Option<&ServiceConfig> {
        self.services.get(name)
    }

    /// Threshold for a service: its own override, falling back to the
    /// agent-wide value.
    pub fn service_threshold(
        &self,
        name: &str,
    ) -> Result<ChangeThreshold> {
        let raw = self
            .service(name)
            .and_then(|s| s.change_threshold)
            .unwrap_or(self.agent.change_threshold);
        ChangeThreshold::new(raw)
    }

    pub fn node_threshold(&self) -> Result<ChangeThreshold> {
        ChangeThreshold::new(self.agent.change_threshold)
    }
}
