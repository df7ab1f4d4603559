//! Per-entity watch loop.
//!
//! Each watched entity gets one task that long-polls the registry, feeds
//! every observation to its own [`ChangeDetector`] and reports confirmed
//! transitions. In fleet-wide mode a transition is only dispatched while
//! this process holds the entity's lock.
//!
//! Cancellation is checked at every poll boundary. Reporting a transition
//! (lock acquisition plus dispatch) is never interrupted halfway; the loop
//! finishes it and stops at the next boundary.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use prometheus::IntGauge;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::metrics::ACTIVE_WATCHES;
use crate::metrics::ALERTS_SUPPRESSED;
use crate::metrics::REGISTRY_ERRORS;
use crate::metrics::TRANSITIONS_DETECTED;
use crate::next_query_index;
use crate::utils::async_task::backoff_delay;
use crate::BackoffPolicy;
use crate::ChangeDetector;
use crate::ChangeThreshold;
use crate::DispatchReport;
use crate::Entity;
use crate::HandlerDispatcher;
use crate::HealthState;
use crate::LockCoordinator;
use crate::LockKey;
use crate::QueryIndex;
use crate::Registry;
use crate::Result;
use crate::Transition;

/// Immutable configuration bound to one watch loop at creation
pub struct WatchOptions<R>
where R: Registry
{
    pub threshold: ChangeThreshold,
    /// Prior confirmed state; `None` makes the first observation the baseline
    pub seed: Option<HealthState>,
    /// Upper bound of one blocking query
    pub wait_time: Duration,
    /// Errors lasting longer than this are reported as persistent
    pub error_ceiling: Duration,
    /// Backoff between failed queries. Only the delays are used: the loop
    /// retries until cancelled.
    pub retry: BackoffPolicy,
    pub registry: Arc<R>,
    pub dispatcher: Arc<HandlerDispatcher>,
    /// Present in fleet-wide mode
    pub locks: Option<Arc<LockCoordinator<R>>>,
}

impl<R> Clone for WatchOptions<R>
where R: Registry
{
    fn clone(&self) -> Self {
        Self {
            threshold: self.threshold,
            seed: self.seed,
            wait_time: self.wait_time,
            error_ceiling: self.error_ceiling,
            retry: self.retry,
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            locks: self.locks.clone(),
        }
    }
}

/// What a watch loop leaves behind when it returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchExit {
    pub entity: Entity,
    pub locks_released: usize,
}

/// Handle to a running watch loop: its own cancellation signal and the
/// number of coordination resources it currently holds.
pub struct WatchHandle {
    entity: Entity,
    cancel: CancellationToken,
    resources: Arc<AtomicUsize>,
    task: JoinHandle<WatchExit>,
}

impl WatchHandle {
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Resources to release on stop: the loop itself plus what each held
    /// lock is made of. Zero once the loop has returned.
    pub fn resources(&self) -> usize {
        self.resources.load(Ordering::SeqCst)
    }

    /// Signals the loop to stop at its next poll boundary
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    /// Waits for the loop to return
    pub async fn join(&mut self) -> Result<WatchExit> {
        Ok((&mut self.task).await?)
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("entity", &self.entity)
            .field("resources", &self.resources())
            .finish()
    }
}

pub struct WatchLoop<R>
where R: Registry
{
    entity: Entity,
    detector: ChangeDetector,
    options: WatchOptions<R>,
    lock_key: LockKey,
    index: QueryIndex,
    resources: Arc<AtomicUsize>,
}

impl<R> WatchLoop<R>
where R: Registry
{
    pub fn new(
        entity: Entity,
        options: WatchOptions<R>,
    ) -> Self {
        let detector = match options.seed {
            Some(prior) => ChangeDetector::seeded(options.threshold, prior),
            None => ChangeDetector::new(options.threshold),
        };
        let lock_key = LockKey::new(&entity, options.dispatcher.handlers().key());

        Self {
            entity,
            detector,
            options,
            lock_key,
            index: 0,
            resources: Arc::new(AtomicUsize::new(1)),
        }
    }

    pub fn lock_key(&self) -> &LockKey {
        &self.lock_key
    }

    /// Starts the loop on the runtime
    pub fn spawn(self) -> WatchHandle {
        let entity = self.entity.clone();
        let cancel = CancellationToken::new();
        let resources = self.resources.clone();
        let task = tokio::spawn(self.run(cancel.clone()));

        WatchHandle {
            entity,
            cancel,
            resources,
            task,
        }
    }

    pub async fn run(
        mut self,
        cancel: CancellationToken,
    ) -> WatchExit {
        let _running = RunningWatch::enter(ACTIVE_WATCHES.clone(), self.resources.clone());
        info!(entity = %self.entity, threshold = self.detector.threshold().get(), "watch started");

        let mut failures: u32 = 0;
        let mut failing_since: Option<Instant> = None;
        let mut escalated = false;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = self.options.registry.query_health(&self.entity, self.index, self.options.wait_time) => r,
            };

            match polled {
                Ok((observation, index)) => {
                    if let Some(since) = failing_since.take() {
                        info!(
                            entity = %self.entity,
                            "registry reachable again after {} failed queries in {:?}",
                            failures,
                            since.elapsed()
                        );
                        failures = 0;
                        escalated = false;
                    }

                    let next = next_query_index(self.index, index);
                    if next == 0 && self.index != 0 {
                        debug!(entity = %self.entity, "registry index went backwards, restarting from 0");
                    }
                    self.index = next;

                    if let Some(change) = self.detector.observe(observation.state) {
                        let transition = Transition {
                            entity: self.entity.clone(),
                            previous: change.previous,
                            current: change.current,
                            timestamp: observation.observed_at,
                            checks: observation.checks,
                        };
                        self.report(&transition).await;
                    }
                }
                Err(e) => {
                    REGISTRY_ERRORS.with_label_values(&[self.entity.kind()]).inc();
                    let since = *failing_since.get_or_insert_with(Instant::now);
                    if !escalated && since.elapsed() >= self.options.error_ceiling {
                        error!(
                            entity = %self.entity,
                            "registry errors persisted for {:?}, still retrying: {}",
                            since.elapsed(),
                            e
                        );
                        escalated = true;
                    } else {
                        warn!(entity = %self.entity, "health query failed: {}", e);
                    }

                    let delay = backoff_delay(&self.options.retry, failures);
                    failures = failures.saturating_add(1);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        let locks_released = self.release().await;
        info!(entity = %self.entity, locks_released, "watch stopped");

        WatchExit {
            entity: self.entity,
            locks_released,
        }
    }

    /// Reports one confirmed transition. Returns `None` when the dispatch
    /// was suppressed because the lock could not be obtained.
    async fn report(
        &self,
        transition: &Transition,
    ) -> Option<DispatchReport> {
        TRANSITIONS_DETECTED
            .with_label_values(&[self.entity.kind(), transition.current.as_str()])
            .inc();
        info!(
            entity = %self.entity,
            previous = %transition.previous,
            current = %transition.current,
            "state transition confirmed"
        );

        if let Some(locks) = &self.options.locks {
            let held = locks.acquire(&self.lock_key).await;
            self.resources.store(1 + locks.resources_held(&self.lock_key), Ordering::SeqCst);
            match held {
                Ok(true) => {}
                Ok(false) => {
                    ALERTS_SUPPRESSED.with_label_values(&[self.entity.kind()]).inc();
                    debug!(entity = %self.entity, "alert suppressed, another agent holds the lock");
                    return None;
                }
                Err(e) => {
                    ALERTS_SUPPRESSED.with_label_values(&[self.entity.kind()]).inc();
                    warn!(entity = %self.entity, "alert suppressed, lock unavailable: {}", e);
                    return None;
                }
            }
        }

        let report = self.options.dispatcher.dispatch(transition).await;
        if !report.all_delivered() {
            warn!(entity = %self.entity, failed = ?report.failed, "some handlers failed");
        }
        Some(report)
    }

    async fn release(&self) -> usize {
        let mut released = 0;
        if let Some(locks) = &self.options.locks {
            match locks.release(&self.lock_key).await {
                Ok(true) => released = 1,
                Ok(false) => {}
                Err(e) => warn!(entity = %self.entity, "failed to release lock: {}", e),
            }
        }
        released
    }
}

/// Marks a loop as running for as long as it is alive. Dropping it, on
/// return or when the task is aborted, decrements the active gauge and
/// zeroes the loop's resource count.
pub(crate) struct RunningWatch {
    active: IntGauge,
    resources: Arc<AtomicUsize>,
}

impl RunningWatch {
    pub(crate) fn enter(
        active: IntGauge,
        resources: Arc<AtomicUsize>,
    ) -> Self {
        active.inc();
        Self { active, resources }
    }
}

impl Drop for RunningWatch {
    fn drop(&mut self) {
        self.active.dec();
        self.resources.store(0, Ordering::SeqCst);
    }
}
