use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::HandlerSet;
use crate::test_utils::*;
use crate::Entity;
use crate::Handler;
use crate::HealthState::Critical;
use crate::HealthState::Passing;
use crate::MockHandler;

fn redis_down() -> Transition {
    transition(Entity::service("redis", Some("alpha")), Passing, Critical)
}

fn dispatcher_of(
    handlers: Vec<Arc<dyn Handler>>,
    handler_timeout: Duration,
) -> HandlerDispatcher {
    HandlerDispatcher::new(HandlerSet::new(handlers), handler_timeout)
}

#[tokio::test]
async fn test_dispatch_reaches_every_handler_in_configured_order() {
    let ops = RecordingHandler::new("ops");
    let audit = RecordingHandler::new("audit");
    let dispatcher = dispatcher_of(vec![ops.clone(), audit.clone()], Duration::from_secs(1));

    let report = dispatcher.dispatch(&redis_down()).await;

    assert!(report.all_delivered());
    assert_eq!(report.delivered, vec!["ops", "audit"]);
    assert_eq!(ops.received(), vec![redis_down()]);
    assert_eq!(audit.received(), vec![redis_down()]);
}

#[tokio::test]
async fn test_failing_handler_does_not_stop_the_rest() {
    let broken = FailingHandler::new("broken");
    let ops = RecordingHandler::new("ops");
    let dispatcher = dispatcher_of(vec![broken, ops.clone()], Duration::from_secs(1));

    let report = dispatcher.dispatch(&redis_down()).await;

    assert!(!report.all_delivered());
    assert_eq!(report.failed, vec!["broken"]);
    assert_eq!(report.delivered, vec!["ops"]);
    assert_eq!(ops.count(), 1);
}

#[tokio::test]
async fn test_panicking_handler_is_isolated() {
    let ops = RecordingHandler::new("ops");
    let dispatcher = dispatcher_of(
        vec![PanickingHandler::new("boom"), ops.clone()],
        Duration::from_secs(1),
    );

    let report = dispatcher.dispatch(&redis_down()).await;

    assert_eq!(report.failed, vec!["boom"]);
    assert_eq!(ops.count(), 1);

    // The dispatcher stays usable afterwards
    let again = dispatcher.dispatch(&redis_down()).await;
    assert_eq!(again.delivered, vec!["ops"]);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_handler_times_out() {
    let ops = RecordingHandler::new("ops");
    let dispatcher = dispatcher_of(
        vec![SlowHandler::new("slow", Duration::from_secs(3600)), ops.clone()],
        Duration::from_millis(100),
    );

    let report = dispatcher.dispatch(&redis_down()).await;

    assert_eq!(report.failed, vec!["slow"]);
    assert_eq!(report.delivered, vec!["ops"]);
}

#[tokio::test]
async fn test_empty_set_delivers_nothing() {
    let dispatcher = dispatcher_of(vec![], Duration::from_secs(1));
    let report = dispatcher.dispatch(&redis_down()).await;
    assert_eq!(report, DispatchReport::default());
    assert!(report.all_delivered());
}

#[tokio::test]
async fn test_handler_receives_full_payload() {
    let mut handler = MockHandler::new();
    handler.expect_name().return_const("pager".to_string());
    handler
        .expect_notify()
        .withf(|t| t.entity.tag() == Some("alpha") && t.previous == Passing && t.current == Critical)
        .times(1)
        .returning(|_| Ok(()));

    let dispatcher = dispatcher_of(vec![Arc::new(handler)], Duration::from_secs(1));
    let report = dispatcher.dispatch(&redis_down()).await;
    assert_eq!(report.delivered, vec!["pager"]);
}
