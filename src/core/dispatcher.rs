use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::timeout;
use tracing::debug;
use tracing::error;

use crate::metrics::ALERTS_DISPATCHED;
use crate::metrics::HANDLER_FAILURES;
use crate::HandlerError;
use crate::HandlerSet;
use crate::Transition;

/// Outcome of one dispatch, by handler name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

impl DispatchReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delivers transitions to an ordered handler set.
///
/// Handlers run one after another in configured order. A failing, hanging
/// or panicking handler is logged and skipped; it never affects the
/// remaining handlers or the calling watch loop.
#[derive(Debug, Clone)]
pub struct HandlerDispatcher {
    handlers: HandlerSet,
    handler_timeout: Duration,
}

impl HandlerDispatcher {
    pub fn new(
        handlers: HandlerSet,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            handlers,
            handler_timeout,
        }
    }

    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    pub async fn dispatch(
        &self,
        transition: &Transition,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();

        for handler in self.handlers.iter() {
            let name = handler.name().to_string();
            let delivery = AssertUnwindSafe(timeout(self.handler_timeout, handler.notify(transition)))
                .catch_unwind()
                .await;

            let result = match delivery {
                Ok(Ok(r)) => r,
                Ok(Err(_)) => Err(HandlerError::Timeout {
                    handler: name.clone(),
                    duration: self.handler_timeout,
                }),
                Err(_) => Err(HandlerError::Panicked { handler: name.clone() }),
            };

            match result {
                Ok(()) => {
                    debug!(entity = %transition.entity, handler = %name, "alert delivered");
                    ALERTS_DISPATCHED.with_label_values(&[&name]).inc();
                    report.delivered.push(name);
                }
                Err(e) => {
                    error!(entity = %transition.entity, handler = %name, "alert delivery failed: {}", e);
                    HANDLER_FAILURES.with_label_values(&[&name]).inc();
                    report.failed.push(name);
                }
            }
        }

        report
    }
}
