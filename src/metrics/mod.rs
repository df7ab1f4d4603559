use lazy_static::lazy_static;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::info;
use tracing::warn;
use warp::Filter;
use warp::Rejection;
use warp::Reply;


lazy_static! {
    pub static ref TRANSITIONS_DETECTED: IntCounterVec = IntCounterVec::new(
        Opts::new("transitions_detected", "Confirmed state transitions by entity kind"),
        &["kind", "current"]
    )
    .expect("metric can not be created");

    pub static ref ALERTS_DISPATCHED: IntCounterVec = IntCounterVec::new(
        Opts::new("alerts_dispatched", "Transitions delivered, by handler"),
        &["handler"]
    )
    .expect("metric can not be created");

    pub static ref HANDLER_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("handler_failures", "Failed deliveries, by handler"),
        &["handler"]
    )
    .expect("metric can not be created");

    pub static ref ALERTS_SUPPRESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("alerts_suppressed", "Transitions not dispatched because another agent holds the lock"),
        &["kind"]
    )
    .expect("metric can not be created");

    pub static ref LOCK_ACQUISITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("lock_acquisitions", "Lock acquisition attempts by outcome"),
        &["outcome"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("registry_errors", "Failed blocking queries by entity kind"),
        &["kind"]
    )
    .expect("metric can not be created");

    pub static ref ACTIVE_WATCHES: IntGauge =
        IntGauge::new("active_watches", "Running watch loops").expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

pub(crate) fn register_custom_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(TRANSITIONS_DETECTED.clone()),
        Box::new(ALERTS_DISPATCHED.clone()),
        Box::new(HANDLER_FAILURES.clone()),
        Box::new(ALERTS_SUPPRESSED.clone()),
        Box::new(LOCK_ACQUISITIONS.clone()),
        Box::new(REGISTRY_ERRORS.clone()),
        Box::new(ACTIVE_WATCHES.clone()),
    ];
    for collector in collectors {
        // AlreadyReg is expected when the server is restarted in-process
        if let Err(e) = REGISTRY.register(collector) {
            warn!("metric registration skipped: {}", e);
        }
    }
}

/// Serves `/metrics` until `shutdown_signal` fires.
///
/// # Errors
/// `Error::Fatal` when the port cannot be bound.
pub async fn start_server(
    port: u16,
    mut shutdown_signal: watch::Receiver<()>,
) -> crate::Result<()> {
    register_custom_metrics();

    let metrics_route = warp::path!("metrics").and_then(metrics_handler);

    let (addr, server) = warp::serve(metrics_route)
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            let _ = shutdown_signal.changed().await;
        })
        .map_err(|e| crate::Error::Fatal(format!("metrics server cannot bind port {}: {}", port, e)))?;
    info!("serving metrics on {}/metrics", addr);
    server.await;
    Ok(())
}

pub(crate) fn render() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("could not encode custom metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    Ok(render())
}
