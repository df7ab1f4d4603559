//! Registry client facade.
//!
//! The alerting core only relies on the semantics exposed by [`Registry`]:
//! index-based blocking queries for health state, catalog discovery and
//! named exclusive reservations. [`ConsulRegistry`] speaks the Consul HTTP
//! API, [`MemoryRegistry`] keeps everything in process for tests and demos.

mod consul;
mod memory;
pub use consul::*;
pub use memory::*;


use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;

use crate::utils::time::get_now_as_millis;
use crate::Result;

/// Monotonic index returned by blocking queries
pub type QueryIndex = u64;

/// The unit of watching: a service (optionally narrowed to one tag) or a
/// cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Service { name: String, tag: Option<String> },
    Node { name: String },
}

impl Entity {
    pub fn service(
        name: impl Into<String>,
        tag: Option<&str>,
    ) -> Self {
        Entity::Service {
            name: name.into(),
            tag: tag.map(str::to_string),
        }
    }

    pub fn node(name: impl Into<String>) -> Self {
        Entity::Node { name: name.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            Entity::Service { name, .. } | Entity::Node { name } => name,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            Entity::Service { tag, .. } => tag.as_deref(),
            Entity::Node { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Entity::Service { .. } => "service",
            Entity::Node { .. } => "node",
        }
    }

    /// Path-like identity, stable across agents: `service/redis`,
    /// `service/redis/alpha`, `node/web-1`
    pub fn key(&self) -> String {
        match self {
            Entity::Service { name, tag: Some(tag) } => format!("service/{}/{}", name, tag),
            Entity::Service { name, tag: None } => format!("service/{}", name),
            Entity::Node { name } => format!("node/{}", name),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Aggregate health of an entity, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Passing,
    Warning,
    Critical,
}

impl HealthState {
    /// Parses a registry check status. Anything unknown (e.g. maintenance)
    /// is treated as critical.
    pub fn from_status(status: &str) -> Self {
        match status {
            "passing" => HealthState::Passing,
            "warning" => HealthState::Warning,
            _ => HealthState::Critical,
        }
    }

    /// Worst state of all checks, passing when there are none
    pub fn aggregate<I>(states: I) -> Self
    where I: IntoIterator<Item = HealthState> {
        states.into_iter().max().unwrap_or(HealthState::Passing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Passing => "passing",
            HealthState::Warning => "warning",
            HealthState::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One health check as reported by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub node: String,
    pub check_id: String,
    pub name: String,
    pub status: HealthState,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub output: String,
}

/// One polled snapshot of an entity's health
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub state: HealthState,
    pub checks: Vec<CheckStatus>,
    /// Unix time in milliseconds
    pub observed_at: u64,
}

impl Observation {
    pub fn new(
        state: HealthState,
        checks: Vec<CheckStatus>,
    ) -> Self {
        Self {
            state,
            checks,
            observed_at: get_now_as_millis(),
        }
    }

    /// Observation whose state is the aggregate of `checks`
    pub fn from_checks(checks: Vec<CheckStatus>) -> Self {
        let state = HealthState::aggregate(checks.iter().map(|c| c.status));
        Self::new(state, checks)
    }
}

/// Where entities are discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryScope {
    /// Every service and node in the catalog (fleet-wide mode)
    Cluster,
    /// Services registered on the local agent plus the local node
    LocalAgent,
}

/// Services (with their tags) and nodes found during discovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub services: BTreeMap<String, Vec<String>>,
    pub nodes: Vec<String>,
}

/// Demo registrations used by dev mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fixture {
    Service {
        name: String,
        tags: Vec<String>,
        port: u16,
        script: String,
        interval: String,
    },
    Check {
        name: String,
        script: String,
        interval: String,
    },
}

impl Fixture {
    pub fn name(&self) -> &str {
        match self {
            Fixture::Service { name, .. } | Fixture::Check { name, .. } => name,
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Address of the registry's current leader; errors when there is none.
    async fn leader(&self) -> Result<String>;

    /// Blocking query for the health of `entity`.
    ///
    /// Returns once the entity's index moves past `since` or `wait`
    /// elapses, whichever comes first, together with the index to pass on
    /// the next call.
    async fn query_health(
        &self,
        entity: &Entity,
        since: QueryIndex,
        wait: Duration,
    ) -> Result<(Observation, QueryIndex)>;

    async fn query_catalog(
        &self,
        scope: DiscoveryScope,
    ) -> Result<Catalog>;

    /// Tries to take the exclusive reservation `key`. `Ok(false)` means
    /// another owner holds it.
    async fn acquire_lock(
        &self,
        key: &str,
    ) -> Result<bool>;

    /// Extends a held reservation. `Ok(false)` means it is no longer ours.
    async fn renew_lock(
        &self,
        key: &str,
    ) -> Result<bool>;

    /// Gives up the reservation. A no-op when not held by this owner.
    async fn release_lock(
        &self,
        key: &str,
    ) -> Result<()>;

    async fn register_fixtures(
        &self,
        fixtures: &[Fixture],
    ) -> Result<()>;

    async fn deregister_fixtures(
        &self,
        fixtures: &[Fixture],
    ) -> Result<()>;
}

/// Index to send on the next blocking query. An index that went backwards
/// means the registry state was reset, so the watch starts over from 0.
pub fn next_query_index(
    requested: QueryIndex,
    returned: QueryIndex,
) -> QueryIndex {
    if returned < requested {
        0
    } else {
        returned
    }
}
