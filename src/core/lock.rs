//! Fleet-wide mutual exclusion for alert firing.
//!
//! In global mode every agent watches the same entities. Before a
//! transition is dispatched the watch loop must hold the lock for its
//! (entity, handler set) pair; agents that fail to get it stay silent.
//!
//! A held lock is made of two coordination primitives: the registry
//! reservation itself and a renewal task keeping the reservation's session
//! alive. Both are given up together by [`LockCoordinator::release`].
//!
//! Exclusivity is advisory. If renewal lapses (for instance during a
//! network partition) the registry expires the reservation and another
//! agent may take it over, so a transition can occasionally be alerted
//! twice or not at all. Alerting is best-effort at-most-one, not
//! exactly-once.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::metrics::LOCK_ACQUISITIONS;
use crate::utils::async_task::retry_with_backoff;
use crate::BackoffPolicy;
use crate::Entity;
use crate::Error;
use crate::LockConfig;
use crate::LockError;
use crate::Registry;
use crate::Result;

/// Coordination primitives behind one held lock: the reservation and its
/// renewal task
pub const RESOURCES_PER_LOCK: usize = 2;

/// Identity of a lock: one per (entity, handler set)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    entity: Entity,
    handler_set: String,
}

impl LockKey {
    pub fn new(
        entity: &Entity,
        handler_set: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.clone(),
            handler_set: handler_set.into(),
        }
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn handler_set(&self) -> &str {
        &self.handler_set
    }

    /// Registry key under `prefix`, e.g. `prefix/service/redis/alpha/ops+pager`
    pub fn path(
        &self,
        prefix: &str,
    ) -> String {
        format!("{}/{}/{}", prefix.trim_end_matches('/'), self.entity.key(), self.handler_set)
    }
}

struct HeldLock {
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
    renewal: Option<JoinHandle<()>>,
}

impl HeldLock {
    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    async fn stop_renewal(&mut self) {
        self.stop.cancel();
        if let Some(renewal) = self.renewal.take() {
            if let Err(e) = renewal.await {
                warn!("lock renewal task ended abnormally: {:?}", e);
            }
        }
    }
}

pub struct LockCoordinator<R>
where R: Registry
{
    registry: Arc<R>,
    prefix: String,
    renew_interval: Duration,
    retry: BackoffPolicy,
    held: DashMap<LockKey, HeldLock>,
}

impl<R> LockCoordinator<R>
where R: Registry
{
    pub fn new(
        registry: Arc<R>,
        config: &LockConfig,
        retry: BackoffPolicy,
    ) -> Self {
        Self {
            registry,
            prefix: config.key_prefix.clone(),
            renew_interval: config.renew_interval(),
            retry,
            held: DashMap::new(),
        }
    }

    pub fn path(
        &self,
        key: &LockKey,
    ) -> String {
        key.path(&self.prefix)
    }

    /// Held by this process and not known to be lost
    pub fn is_held(
        &self,
        key: &LockKey,
    ) -> bool {
        self.held.get(key).map(|h| !h.is_lost()).unwrap_or(false)
    }

    /// Locks this process currently tracks, lost ones included
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Coordination primitives that must be released for `key`
    pub fn resources_held(
        &self,
        key: &LockKey,
    ) -> usize {
        if self.held.contains_key(key) {
            RESOURCES_PER_LOCK
        } else {
            0
        }
    }

    /// Acquires `key`, retrying transient registry errors with the lock
    /// backoff policy. `Ok(false)` means another agent holds it.
    pub async fn acquire(
        &self,
        key: &LockKey,
    ) -> Result<bool> {
        let policy = self.retry;
        self.acquire_with(key, &policy).await
    }

    /// Single attempt variant of [`acquire`](Self::acquire): returns the
    /// current holder status right away.
    pub async fn try_acquire(
        &self,
        key: &LockKey,
    ) -> Result<bool> {
        let policy = BackoffPolicy {
            max_retries: 1,
            ..self.retry
        };
        self.acquire_with(key, &policy).await
    }

    async fn acquire_with(
        &self,
        key: &LockKey,
        policy: &BackoffPolicy,
    ) -> Result<bool> {
        if self.is_held(key) {
            return Ok(true);
        }

        let path = self.path(key);

        // A lost reservation leaves its finished renewal task behind
        if let Some((_, mut stale)) = self.held.remove(key) {
            warn!(lock = %path, "lock was lost, trying to reacquire");
            stale.stop_renewal().await;
        }

        let registry = &self.registry;
        let p = path.as_str();
        let acquired = match retry_with_backoff(|| registry.acquire_lock(p), policy).await {
            Ok(acquired) => acquired,
            Err(e) => {
                LOCK_ACQUISITIONS.with_label_values(&["error"]).inc();
                return Err(lock_error(&path, e));
            }
        };

        if acquired {
            LOCK_ACQUISITIONS.with_label_values(&["acquired"]).inc();
            info!(lock = %path, "lock acquired");
            self.held.insert(key.clone(), self.spawn_renewal(path));
        } else {
            LOCK_ACQUISITIONS.with_label_values(&["contended"]).inc();
            debug!(lock = %path, "lock held by another agent");
        }
        Ok(acquired)
    }

    fn spawn_renewal(
        &self,
        path: String,
    ) -> HeldLock {
        let lost = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();
        let registry = self.registry.clone();
        let interval = self.renew_interval;

        let renewal = {
            let lost = lost.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => return,
                        _ = sleep(interval) => {}
                    }

                    match registry.renew_lock(&path).await {
                        Ok(true) => trace!(lock = %path, "lock renewed"),
                        Ok(false) => {
                            warn!(lock = %path, "lock lost: reservation expired or taken over");
                            lost.store(true, Ordering::SeqCst);
                            return;
                        }
                        // The session may still be alive; the next tick decides
                        Err(e) => warn!(lock = %path, "lock renewal failed: {}", e),
                    }
                }
            })
        };

        HeldLock {
            lost,
            stop,
            renewal: Some(renewal),
        }
    }

    /// Stops renewal and gives the reservation back, retrying transient
    /// registry errors with the lock backoff policy. Returns whether
    /// anything was held; releasing a lock this process does not hold is a
    /// no-op.
    ///
    /// A reservation the registry refused to release stays tracked (as
    /// lost, no longer renewed) so a later `release` or
    /// [`release_all`](Self::release_all) tries again.
    pub async fn release(
        &self,
        key: &LockKey,
    ) -> Result<bool> {
        let Some((_, mut held)) = self.held.remove(key) else {
            return Ok(false);
        };

        let path = self.path(key);
        held.stop_renewal().await;

        let registry = &self.registry;
        let p = path.as_str();
        match retry_with_backoff(|| registry.release_lock(p), &self.retry).await {
            Ok(()) => {
                info!(lock = %path, "lock released");
                Ok(true)
            }
            Err(e) => {
                warn!(lock = %path, "lock release failed, keeping it for the next sweep: {}", e);
                held.lost.store(true, Ordering::SeqCst);
                self.held.insert(key.clone(), held);
                Err(lock_error(&path, e))
            }
        }
    }

    /// Releases every tracked lock and returns how many were released
    pub async fn release_all(&self) -> usize {
        let keys: Vec<LockKey> = self.held.iter().map(|e| e.key().clone()).collect();
        let mut released = 0;
        for key in keys {
            match self.release(&key).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => warn!("failed to release lock for {}: {}", key.entity(), e),
            }
        }
        released
    }
}

impl<R> Drop for LockCoordinator<R>
where R: Registry
{
    fn drop(&mut self) {
        // Reservations left behind expire with their sessions
        for entry in self.held.iter() {
            entry.value().stop.cancel();
        }
    }
}

fn lock_error(
    path: &str,
    e: Error,
) -> Error {
    match e {
        Error::Registry(source) => LockError::Registry {
            key: path.to_string(),
            source,
        }
        .into(),
        other => other,
    }
}
