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

#[tokio::test]
async fn test_local_mode_never_touches_locks() {
    crate::enable_logger();
    let registry = MemoryRegistry::new("agent-a");
    let redis = Entity::service("redis", None);
    let node = Entity::node("web-1");
    registry.set_local_catalog(catalog(&["redis"], &["web-1"]));
    registry.set_health(&redis, Passing);
    registry.set_health(&node, Passing);

    let agent = RunningAgent::start(settings("agent-a", false), registry.clone());
    tokio::time::sleep(SETTLE).await;
    publish(&registry, &redis, Critical).await;
    publish(&registry, &node, Warning).await;
    assert!(wait_until(WAIT_FOR_ALERT, || agent.alerts.count() == 2).await);

    let report = agent.stop().await;
    assert_eq!(report.stopped, 2);
    assert_eq!(report.locks_released, 0);
    assert_eq!(registry.lock_requests(), 0);
}

#[tokio::test]
async fn test_local_mode_ignores_services_on_other_agents() {
    crate::enable_logger();
    let registry = MemoryRegistry::new("agent-a");
    registry.set_catalog(catalog(&["redis", "nginx"], &["web-1", "web-2"]));
    registry.set_local_catalog(catalog(&["redis"], &[]));
    let nginx = Entity::service("nginx", None);
    registry.set_health(&nginx, Passing);

    let agent = RunningAgent::start(settings("agent-a", false), registry.clone());
    tokio::time::sleep(SETTLE).await;
    publish(&registry, &nginx, Critical).await;
    tokio::time::sleep(SETTLE).await;

    assert_eq!(agent.alerts.count(), 0);
    let report = agent.stop().await;
    assert_eq!(report.stopped, 1);
}

/// With a threshold of 3, a lone critical blip is absorbed and only a
/// third consecutive critical observation is reported.
#[tokio::test]
async fn test_threshold_absorbs_flapping() {
    crate::enable_logger();
    let registry = MemoryRegistry::new("agent-a");
    let redis = Entity::service("redis", None);
    registry.set_local_catalog(catalog(&["redis"], &[]));
    registry.set_health(&redis, Passing);

    let mut settings = settings("agent-a", false);
    settings.agent.change_threshold = 3;
    // Only index changes may produce observations in this test
    settings.watch.wait_time_ms = 60_000;

    let agent = RunningAgent::start(settings, registry.clone());
    tokio::time::sleep(SETTLE).await;

    publish(&registry, &redis, Critical).await;
    publish(&registry, &redis, Passing).await;
    publish(&registry, &redis, Critical).await;
    publish(&registry, &redis, Critical).await;
    assert_eq!(agent.alerts.count(), 0);

    publish(&registry, &redis, Critical).await;
    assert!(wait_until(WAIT_FOR_ALERT, || agent.alerts.count() == 1).await);
    assert_eq!(agent.alerts.states(), vec![(Passing, Critical)]);

    publish(&registry, &redis, Critical).await;
    assert_eq!(agent.alerts.count(), 1);

    agent.stop().await;
}

#[tokio::test]
async fn test_transitions_are_reported_in_order() {
    crate::enable_logger();
    let registry = MemoryRegistry::new("agent-a");
    let node = Entity::node("web-1");
    registry.set_local_catalog(catalog(&[], &["web-1"]));
    registry.set_health(&node, Passing);

    let agent = RunningAgent::start(settings("agent-a", false), registry.clone());
    tokio::time::sleep(SETTLE).await;
    for state in [Warning, Critical, Warning, Passing] {
        publish(&registry, &node, state).await;
    }
    assert!(wait_until(WAIT_FOR_ALERT, || agent.alerts.count() == 4).await);

    assert_eq!(
        agent.alerts.states(),
        vec![(Passing, Warning), (Warning, Critical), (Critical, Warning), (Warning, Passing)]
    );
    let received = agent.alerts.received();
    assert!(received.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert!(received.last().unwrap().is_recovery());

    agent.stop().await;
}
