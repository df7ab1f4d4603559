use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::Handler;
use crate::HandlerError;
use crate::Transition;

/// Remembers every transition it receives
#[derive(Default)]
pub(crate) struct RecordingHandler {
    name: String,
    received: Mutex<Vec<Transition>>,
    notify: Notify,
}

impl RecordingHandler {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ..Default::default()
        })
    }

    pub(crate) fn received(&self) -> Vec<Transition> {
        self.received.lock().clone()
    }

    pub(crate) fn count(&self) -> usize {
        self.received.lock().len()
    }

    /// Waits until at least `n` transitions arrived
    pub(crate) async fn wait_for(
        &self,
        n: usize,
    ) {
        loop {
            let notified = self.notify.notified();
            if self.count() >= n {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(
        &self,
        transition: &Transition,
    ) -> Result<(), HandlerError> {
        self.received.lock().push(transition.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

pub(crate) struct FailingHandler {
    name: String,
}

impl FailingHandler {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.to_string() })
    }
}

#[async_trait]
impl Handler for FailingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(
        &self,
        _transition: &Transition,
    ) -> Result<(), HandlerError> {
        Err(HandlerError::Failed {
            handler: self.name.clone(),
            reason: "sink rejected the alert".to_string(),
        })
    }
}

pub(crate) struct PanickingHandler {
    name: String,
}

impl PanickingHandler {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.to_string() })
    }
}

#[async_trait]
impl Handler for PanickingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(
        &self,
        _transition: &Transition,
    ) -> Result<(), HandlerError> {
        panic!("handler {} blew up", self.name);
    }
}

/// Sleeps before succeeding
pub(crate) struct SlowHandler {
    name: String,
    delay: Duration,
}

impl SlowHandler {
    pub(crate) fn new(
        name: &str,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delay,
        })
    }
}

#[async_trait]
impl Handler for SlowHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(
        &self,
        _transition: &Transition,
    ) -> Result<(), HandlerError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
