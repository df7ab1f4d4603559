use consul_alerting::Entity;
use consul_alerting::HealthState::Critical;
use consul_alerting::HealthState::Passing;
use consul_alerting::HealthState::Warning;
use consul_alerting::MemoryRegistry;

use crate::common::catalog;
use crate::common::publish;
use crate::common::settings;
use crate::common::wait_until;
use crate::common::RunningAgent;
use crate::common::SETTLE;
use crate::common::WAIT_FOR_ALERT;

const REDIS_LOCK: &str = "consul-alerting/lock/service/redis/ops";

/// Two agents watch `redis`. A alerts first and keeps the lock, so every
/// later transition is reported by A only; B's dispatches are suppressed.
#[tokio::test]
async fn test_only_lock_holder_alerts() {
    crate::enable_logger();
    let cluster = MemoryRegistry::new("agent-a");
    let redis = Entity::service("redis", None);
    cluster.set_catalog(catalog(&["redis"], &[]));
    cluster.set_health(&redis, Passing);

    let a = RunningAgent::start(settings("agent-a", true), cluster.clone());
    tokio::time::sleep(SETTLE).await;
    publish(&cluster, &redis, Critical).await;
    assert!(wait_until(WAIT_FOR_ALERT, || a.alerts.count() == 1).await);
    assert_eq!(cluster.lock_owner(REDIS_LOCK).as_deref(), Some("agent-a"));

    let b = RunningAgent::start(settings("agent-b", true), cluster.peer("agent-b"));
    tokio::time::sleep(SETTLE).await;
    publish(&cluster, &redis, Warning).await;
    publish(&cluster, &redis, Passing).await;
    assert!(wait_until(WAIT_FOR_ALERT, || a.alerts.count() == 3).await);
    tokio::time::sleep(SETTLE).await;

    assert_eq!(a.alerts.states(), vec![(Passing, Critical), (Critical, Warning), (Warning, Passing)]);
    assert_eq!(b.alerts.count(), 0);

    b.stop().await;
    a.stop().await;
}

/// Concurrent agents seeing the same transition: exactly one alerts
#[tokio::test]
async fn test_concurrent_agents_alert_once() {
    crate::enable_logger();
    let cluster = MemoryRegistry::new("agent-0");
    let node = Entity::node("web-1");
    cluster.set_catalog(catalog(&[], &["web-1"]));
    cluster.set_health(&node, Passing);

    let agents: Vec<RunningAgent> = (0..4)
        .map(|i| {
            let id = format!("agent-{}", i);
            RunningAgent::start(settings(&id, true), cluster.peer(id.as_str()))
        })
        .collect();
    tokio::time::sleep(SETTLE).await;

    publish(&cluster, &node, Critical).await;
    assert!(wait_until(WAIT_FOR_ALERT, || agents.iter().map(|a| a.alerts.count()).sum::<usize>() >= 1).await);
    tokio::time::sleep(SETTLE).await;

    let alerted: Vec<usize> = agents.iter().map(|a| a.alerts.count()).collect();
    assert_eq!(alerted.iter().sum::<usize>(), 1, "alerts per agent: {:?}", alerted);

    let winner = alerted.iter().position(|n| *n == 1).unwrap();
    assert_eq!(
        cluster.lock_owner("consul-alerting/lock/node/web-1/ops"),
        Some(format!("agent-{}", winner))
    );

    for agent in agents {
        agent.stop().await;
    }
    assert!(cluster.held_locks().is_empty());
}

/// Stopping the holder releases its lock, and the next transition is
/// reported by the surviving agent.
#[tokio::test]
async fn test_lock_released_on_shutdown_and_taken_over() {
    crate::enable_logger();
    let cluster = MemoryRegistry::new("agent-a");
    let redis = Entity::service("redis", None);
    cluster.set_catalog(catalog(&["redis"], &[]));
    cluster.set_health(&redis, Passing);

    let a = RunningAgent::start(settings("agent-a", true), cluster.clone());
    tokio::time::sleep(SETTLE).await;
    publish(&cluster, &redis, Critical).await;
    assert!(wait_until(WAIT_FOR_ALERT, || a.alerts.count() == 1).await);

    let b = RunningAgent::start(settings("agent-b", true), cluster.peer("agent-b"));
    tokio::time::sleep(SETTLE).await;

    let report = a.stop().await;
    assert_eq!(report.locks_released, 1);
    assert!(report.is_clean());
    assert!(cluster.held_locks().is_empty());

    publish(&cluster, &redis, Passing).await;
    assert!(wait_until(WAIT_FOR_ALERT, || b.alerts.count() == 1).await);
    assert_eq!(b.alerts.states(), vec![(Critical, Passing)]);
    assert_eq!(cluster.lock_owner(REDIS_LOCK).as_deref(), Some("agent-b"));

    let report = b.stop().await;
    assert_eq!(report.locks_released, 1);
    assert!(cluster.held_locks().is_empty());
}

/// A reservation that expires behind the holder's back is reacquired
/// before the next alert instead of crashing the watch.
#[tokio::test]
async fn test_expired_lock_is_reacquired() {
    crate::enable_logger();
    let cluster = MemoryRegistry::new("agent-a");
    let redis = Entity::service("redis", None);
    cluster.set_catalog(catalog(&["redis"], &[]));
    cluster.set_health(&redis, Passing);

    let a = RunningAgent::start(settings("agent-a", true), cluster.clone());
    tokio::time::sleep(SETTLE).await;
    publish(&cluster, &redis, Critical).await;
    assert!(wait_until(WAIT_FOR_ALERT, || a.alerts.count() == 1).await);

    cluster.expire_lock(REDIS_LOCK);
    // Let the renewal task notice the reservation is gone
    tokio::time::sleep(SETTLE * 2).await;
    assert_eq!(cluster.lock_owner(REDIS_LOCK), None);
    publish(&cluster, &redis, Passing).await;
    assert!(wait_until(WAIT_FOR_ALERT, || a.alerts.count() == 2).await);
    assert_eq!(cluster.lock_owner(REDIS_LOCK).as_deref(), Some("agent-a"));

    a.stop().await;
}
