use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::Catalog;
use crate::DiscoveryScope;
use crate::Entity;
use crate::Fixture;
use crate::HealthState;
use crate::MemoryRegistry;
use crate::Observation;
use crate::QueryIndex;
use crate::Registry;
use crate::RegistryError;
use crate::Result;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    Observe(HealthState),
    Fail,
}

/// Replays a fixed sequence of health query results, one per query, with
/// a strictly increasing index. Once the script is used up, queries block
/// forever. Lock calls go to an embedded [`MemoryRegistry`].
pub(crate) struct ScriptedRegistry {
    script: Mutex<VecDeque<Step>>,
    index: AtomicU64,
    idle: AtomicBool,
    idle_notify: Notify,
    locks: MemoryRegistry,
}

impl ScriptedRegistry {
    pub(crate) fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self::with_locks(steps, MemoryRegistry::new("scripted"))
    }

    pub(crate) fn observing(states: &[HealthState]) -> Self {
        Self::new(states.iter().copied().map(Step::Observe))
    }

    pub(crate) fn with_locks(
        steps: impl IntoIterator<Item = Step>,
        locks: MemoryRegistry,
    ) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            index: AtomicU64::new(0),
            idle: AtomicBool::new(false),
            idle_notify: Notify::new(),
            locks,
        }
    }

    pub(crate) fn locks(&self) -> &MemoryRegistry {
        &self.locks
    }

    /// Waits until the script is used up and the caller came back for more,
    /// i.e. everything scripted has been fully processed
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle_notify.notified();
            if self.idle.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Registry for ScriptedRegistry {
    async fn leader(&self) -> Result<String> {
        Ok("scripted:8300".to_string())
    }

    async fn query_health(
        &self,
        _entity: &Entity,
        _since: QueryIndex,
        _wait: Duration,
    ) -> Result<(Observation, QueryIndex)> {
        let step = self.script.lock().pop_front();
        match step {
            Some(Step::Observe(state)) => {
                let index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((Observation::new(state, vec![]), index))
            }
            Some(Step::Fail) => Err(RegistryError::Unavailable("scripted failure".to_string()).into()),
            None => {
                self.idle.store(true, Ordering::SeqCst);
                self.idle_notify.notify_waiters();
                std::future::pending().await
            }
        }
    }

    async fn query_catalog(
        &self,
        scope: DiscoveryScope,
    ) -> Result<Catalog> {
        self.locks.query_catalog(scope).await
    }

    async fn acquire_lock(
        &self,
        key: &str,
    ) -> Result<bool> {
        self.locks.acquire_lock(key).await
    }

    async fn renew_lock(
        &self,
        key: &str,
    ) -> Result<bool> {
        self.locks.renew_lock(key).await
    }

    async fn release_lock(
        &self,
        key: &str,
    ) -> Result<()> {
        self.locks.release_lock(key).await
    }

    async fn register_fixtures(
        &self,
        fixtures: &[Fixture],
    ) -> Result<()> {
        self.locks.register_fixtures(fixtures).await
    }

    async fn deregister_fixtures(
        &self,
        fixtures: &[Fixture],
    ) -> Result<()> {
        self.locks.deregister_fixtures(fixtures).await
    }
}
