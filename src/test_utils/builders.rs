use std::sync::Arc;
use std::time::Duration;

use crate::BackoffPolicy;
use crate::ChangeThreshold;
use crate::Entity;
use crate::Handler;
use crate::HandlerDispatcher;
use crate::HandlerSet;
use crate::HealthState;
use crate::LockConfig;
use crate::LockCoordinator;
use crate::Registry;
use crate::Transition;
use crate::WatchOptions;

pub(crate) fn transition(
    entity: Entity,
    previous: HealthState,
    current: HealthState,
) -> Transition {
    Transition {
        entity,
        previous,
        current,
        timestamp: 1_700_000_000_000,
        checks: vec![],
    }
}

pub(crate) fn fast_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 3,
        timeout_ms: 200,
        base_delay_ms: 5,
        max_delay_ms: 20,
    }
}

pub(crate) fn lock_config() -> LockConfig {
    LockConfig {
        key_prefix: "alerting/lock".to_string(),
        ttl_ms: 15_000,
        renew_interval_ms: 5_000,
    }
}

pub(crate) fn dispatcher(handlers: Vec<Arc<dyn Handler>>) -> Arc<HandlerDispatcher> {
    Arc::new(HandlerDispatcher::new(
        HandlerSet::new(handlers),
        Duration::from_millis(500),
    ))
}

/// Local mode options with threshold 1 and short waits
pub(crate) fn watch_options<R: Registry>(
    registry: Arc<R>,
    handlers: Vec<Arc<dyn Handler>>,
) -> WatchOptions<R> {
    WatchOptions {
        threshold: ChangeThreshold::IMMEDIATE,
        seed: None,
        wait_time: Duration::from_millis(200),
        error_ceiling: Duration::from_secs(1),
        retry: fast_retry(),
        registry,
        dispatcher: dispatcher(handlers),
        locks: None,
    }
}

/// Fleet-wide mode options: same as [`watch_options`] plus a lock coordinator
pub(crate) fn global_watch_options<R: Registry>(
    registry: Arc<R>,
    handlers: Vec<Arc<dyn Handler>>,
) -> WatchOptions<R> {
    let locks = Arc::new(LockCoordinator::new(registry.clone(), &lock_config(), fast_retry()));
    WatchOptions {
        locks: Some(locks),
        ..watch_options(registry, handlers)
    }
}
