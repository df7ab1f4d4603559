use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use consul_alerting::Agent;
use consul_alerting::BackoffPolicy;
use consul_alerting::Catalog;
use consul_alerting::Entity;
use consul_alerting::Handler;
use consul_alerting::HandlerError;
use consul_alerting::HandlerRegistry;
use consul_alerting::HealthState;
use consul_alerting::MemoryRegistry;
use consul_alerting::Result;
use consul_alerting::Settings;
use consul_alerting::ShutdownReport;
use consul_alerting::Transition;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const WAIT_FOR_ALERT: Duration = Duration::from_secs(5);
/// Long enough for every watch to pick up a registry change
pub const SETTLE: Duration = Duration::from_millis(150);

#[derive(Default)]
pub struct RecordingHandler {
    received: Mutex<Vec<Transition>>,
}

impl RecordingHandler {
    pub fn received(&self) -> Vec<Transition> {
        self.received.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn states(&self) -> Vec<(HealthState, HealthState)> {
        self.received().iter().map(|t| (t.previous, t.current)).collect()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    fn name(&self) -> &str {
        "ops"
    }

    async fn notify(
        &self,
        transition: &Transition,
    ) -> std::result::Result<(), HandlerError> {
        self.received.lock().push(transition.clone());
        Ok(())
    }
}

pub fn settings(
    agent_id: &str,
    global_mode: bool,
) -> Settings {
    let mut settings = Settings::default();
    settings.agent.agent_id = agent_id.to_string();
    settings.agent.global_mode = global_mode;
    settings.watch.wait_time_ms = 200;
    settings.retry.registry = BackoffPolicy {
        max_retries: 0,
        timeout_ms: 1_000,
        base_delay_ms: 10,
        max_delay_ms: 50,
    };
    settings.retry.lock = BackoffPolicy {
        max_retries: 3,
        timeout_ms: 500,
        base_delay_ms: 5,
        max_delay_ms: 20,
    };
    settings.lock.ttl_ms = 1_000;
    settings.lock.renew_interval_ms = 100;
    settings.shutdown.grace_period_ms = 2_000;
    settings
}

pub fn catalog(
    services: &[&str],
    nodes: &[&str],
) -> Catalog {
    let mut catalog = Catalog::default();
    for service in services {
        catalog.services.insert(service.to_string(), vec![]);
    }
    catalog.nodes = nodes.iter().map(|n| n.to_string()).collect();
    catalog
}

pub struct RunningAgent {
    pub alerts: Arc<RecordingHandler>,
    shutdown: watch::Sender<()>,
    task: JoinHandle<Result<ShutdownReport>>,
}

impl RunningAgent {
    pub fn start(
        settings: Settings,
        registry: MemoryRegistry,
    ) -> Self {
        let alerts = Arc::new(RecordingHandler::default());
        let mut handlers = HandlerRegistry::default();
        handlers.insert(alerts.clone());

        let (shutdown, rx) = watch::channel(());
        let agent = Agent::new(settings, Arc::new(registry), handlers);
        let task = tokio::spawn(agent.run(rx));

        Self { alerts, shutdown, task }
    }

    pub async fn stop(self) -> ShutdownReport {
        self.shutdown.send(()).expect("agent still listening");
        self.task.await.expect("agent task").expect("agent run")
    }
}

/// Polls `condition` until it holds or `timeout` elapses
pub async fn wait_until(
    timeout: Duration,
    condition: impl Fn() -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Publishes `state` and gives the watches time to observe it
pub async fn publish(
    registry: &MemoryRegistry,
    entity: &Entity,
    state: HealthState,
) {
    registry.set_health(entity, state);
    tokio::time::sleep(SETTLE).await;
}
