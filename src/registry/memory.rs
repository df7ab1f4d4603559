//! In-process registry.
//!
//! Several [`MemoryRegistry`] views can share one cluster state, each with
//! its own owner identity, which is how tests model a fleet of agents
//! competing for the same locks. Blocking queries behave like the real
//! registry: they return as soon as the entity's index passes `since`, or
//! with the unchanged state once `wait` elapses.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::timeout_at;
use tokio::time::Instant;
use tracing::trace;

use super::Catalog;
use super::CheckStatus;
use super::DiscoveryScope;
use super::Entity;
use super::Fixture;
use super::HealthState;
use super::Observation;
use super::QueryIndex;
use super::Registry;
use crate::RegistryError;
use crate::Result;

#[derive(Debug)]
struct ClusterState {
    index: QueryIndex,
    health: HashMap<Entity, (Observation, QueryIndex)>,
    catalog: Catalog,
    local: HashMap<String, Catalog>,
    leader: Option<String>,
    locks: HashMap<String, String>,
    lock_requests: usize,
    failing_queries: usize,
    failing_releases: usize,
    /// Fixtures accepted before registration starts failing
    fixture_capacity: Option<usize>,
    fixtures: BTreeSet<String>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            index: 1,
            health: HashMap::new(),
            catalog: Catalog::default(),
            local: HashMap::new(),
            leader: Some("memory:8300".to_string()),
            locks: HashMap::new(),
            lock_requests: 0,
            failing_queries: 0,
            failing_releases: 0,
            fixture_capacity: None,
            fixtures: BTreeSet::new(),
        }
    }
}

struct Shared {
    state: Mutex<ClusterState>,
    changes: watch::Sender<QueryIndex>,
}

/// One agent's view of a shared in-memory cluster
#[derive(Clone)]
pub struct MemoryRegistry {
    shared: Arc<Shared>,
    owner: String,
}

impl std::fmt::Debug for MemoryRegistry {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("MemoryRegistry").field("owner", &self.owner).finish()
    }
}

impl MemoryRegistry {
    pub fn new(owner: impl Into<String>) -> Self {
        let (changes, _) = watch::channel(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ClusterState::default()),
                changes,
            }),
            owner: owner.into(),
        }
    }

    /// Another agent's view of the same cluster
    pub fn peer(
        &self,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            shared: self.shared.clone(),
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut ClusterState) -> R,
    ) -> R {
        let (r, index) = {
            let mut state = self.shared.state.lock();
            let r = f(&mut state);
            (r, state.index)
        };
        self.shared.changes.send_replace(index);
        r
    }

    /// Publishes a new observation for `entity` and returns its index
    pub fn set_observation(
        &self,
        entity: &Entity,
        observation: Observation,
    ) -> QueryIndex {
        self.mutate(|state| {
            state.index += 1;
            let index = state.index;
            state.health.insert(entity.clone(), (observation, index));
            index
        })
    }

    /// Publishes `state` for `entity` as a single synthetic check
    pub fn set_health(
        &self,
        entity: &Entity,
        health: HealthState,
    ) -> QueryIndex {
        let check = CheckStatus {
            node: "memory".to_string(),
            check_id: format!("{}:check", entity.key()),
            name: format!("{} health", entity.name()),
            status: health,
            service_id: entity.tag().map(|_| entity.name().to_string()).unwrap_or_default(),
            output: String::new(),
        };
        self.set_observation(entity, Observation::new(health, vec![check]))
    }

    pub fn set_catalog(
        &self,
        catalog: Catalog,
    ) {
        self.mutate(|state| state.catalog = catalog);
    }

    /// Catalog returned to this owner for [`DiscoveryScope::LocalAgent`]
    pub fn set_local_catalog(
        &self,
        catalog: Catalog,
    ) {
        let owner = self.owner.clone();
        self.mutate(|state| {
            state.local.insert(owner, catalog);
        });
    }

    pub fn set_leader(
        &self,
        leader: Option<&str>,
    ) {
        self.mutate(|state| state.leader = leader.map(str::to_string));
    }

    /// The next `n` health queries (from any view) fail as unavailable
    pub fn fail_next_queries(
        &self,
        n: usize,
    ) {
        self.mutate(|state| state.failing_queries = n);
    }

    /// The next `n` lock releases (from any view) fail as unavailable
    pub fn fail_next_releases(
        &self,
        n: usize,
    ) {
        self.mutate(|state| state.failing_releases = n);
    }

    /// Fixture registration accepts `n` fixtures, then fails
    pub fn limit_fixtures(
        &self,
        n: usize,
    ) {
        self.mutate(|state| state.fixture_capacity = Some(n));
    }

    pub fn lock_owner(
        &self,
        key: &str,
    ) -> Option<String> {
        self.shared.state.lock().locks.get(key).cloned()
    }

    /// Keys currently held by anyone
    pub fn held_locks(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.state.lock().locks.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of acquire, renew and release calls made by any view
    pub fn lock_requests(&self) -> usize {
        self.shared.state.lock().lock_requests
    }

    /// Drops a reservation as if its session had expired
    pub fn expire_lock(
        &self,
        key: &str,
    ) {
        self.mutate(|state| {
            state.locks.remove(key);
        });
    }

    pub fn fixtures(&self) -> Vec<String> {
        self.shared.state.lock().fixtures.iter().cloned().collect()
    }

    fn current(
        state: &ClusterState,
        entity: &Entity,
    ) -> (Observation, QueryIndex) {
        state
            .health
            .get(entity)
            .cloned()
            // Unknown entities look like a deregistered service: no checks, critical
            .unwrap_or_else(|| (Observation::new(HealthState::Critical, vec![]), state.index))
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn leader(&self) -> Result<String> {
        self.shared.state.lock().leader.clone().ok_or_else(|| RegistryError::NoLeader.into())
    }

    async fn query_health(
        &self,
        entity: &Entity,
        since: QueryIndex,
        wait: Duration,
    ) -> Result<(Observation, QueryIndex)> {
        let deadline = Instant::now() + wait;
        // Subscribe before reading so no update between the read and the wait is lost
        let mut changes = self.shared.changes.subscribe();

        loop {
            let current = {
                let mut state = self.shared.state.lock();
                if state.failing_queries > 0 {
                    state.failing_queries -= 1;
                    return Err(RegistryError::Unavailable("injected failure".to_string()).into());
                }
                Self::current(&state, entity)
            };

            if current.1 > since {
                trace!(entity = %entity, index = current.1, "memory registry: state changed");
                return Ok(current);
            }

            match timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Ok(current),
            }
        }
    }

    async fn query_catalog(
        &self,
        scope: DiscoveryScope,
    ) -> Result<Catalog> {
        let state = self.shared.state.lock();
        Ok(match scope {
            DiscoveryScope::Cluster => state.catalog.clone(),
            DiscoveryScope::LocalAgent => state.local.get(&self.owner).cloned().unwrap_or_default(),
        })
    }

    async fn acquire_lock(
        &self,
        key: &str,
    ) -> Result<bool> {
        let owner = self.owner.clone();
        Ok(self.mutate(|state| {
            state.lock_requests += 1;
            match state.locks.get(key) {
                Some(holder) if *holder != owner => false,
                _ => {
                    state.locks.insert(key.to_string(), owner);
                    true
                }
            }
        }))
    }

    async fn renew_lock(
        &self,
        key: &str,
    ) -> Result<bool> {
        let mut state = self.shared.state.lock();
        state.lock_requests += 1;
        Ok(state.locks.get(key) == Some(&self.owner))
    }

    async fn release_lock(
        &self,
        key: &str,
    ) -> Result<()> {
        let owner = self.owner.clone();
        self.mutate(|state| -> Result<()> {
            state.lock_requests += 1;
            if state.failing_releases > 0 {
                state.failing_releases -= 1;
                return Err(RegistryError::Unavailable("injected failure".to_string()).into());
            }
            if state.locks.get(key) == Some(&owner) {
                state.locks.remove(key);
            }
            Ok(())
        })
    }

    async fn register_fixtures(
        &self,
        fixtures: &[Fixture],
    ) -> Result<()> {
        self.mutate(|state| -> Result<()> {
            for fixture in fixtures {
                if let Some(capacity) = state.fixture_capacity {
                    if capacity == 0 {
                        return Err(RegistryError::Unavailable(format!("cannot register {}", fixture.name())).into());
                    }
                    state.fixture_capacity = Some(capacity - 1);
                }
                state.fixtures.insert(fixture.name().to_string());
            }
            Ok(())
        })
    }

    async fn deregister_fixtures(
        &self,
        fixtures: &[Fixture],
    ) -> Result<()> {
        self.mutate(|state| {
            for fixture in fixtures {
                state.fixtures.remove(fixture.name());
            }
        });
        Ok(())
    }
}
