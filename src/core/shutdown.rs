use std::time::Duration;

use tokio::time::timeout_at;
use tokio::time::Instant;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::Entity;
use crate::WatchHandle;

/// Outcome of an orderly stop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Watches that returned within the grace period
    pub stopped: usize,
    /// One per coordination resource held when the stop was requested
    pub stop_signals: usize,
    /// Locks released by the watches themselves
    pub locks_released: usize,
    /// Watches whose task failed
    pub failed: Vec<Entity>,
    /// Watches aborted after the grace period ran out
    pub timed_out: Vec<Entity>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

/// Owns the handles of every running watch and stops them together.
///
/// Each handle carries its own cancellation signal and resource count, so
/// stopping needs no process-wide counters.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    handles: Vec<WatchHandle>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self {
            handles: Vec::new(),
            grace,
        }
    }

    pub fn register(
        &mut self,
        handle: WatchHandle,
    ) {
        self.handles.push(handle);
    }

    /// Watches still running
    pub fn active(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Coordination resources currently held across all watches
    pub fn resources(&self) -> usize {
        self.handles.iter().map(|h| h.resources()).sum()
    }

    pub fn entities(&self) -> Vec<&Entity> {
        self.handles.iter().map(|h| h.entity()).collect()
    }

    /// Signals every watch to stop, then waits for them up to the grace
    /// period. Watches still running at the deadline are aborted.
    pub async fn shutdown(self) -> ShutdownReport {
        let deadline = Instant::now() + self.grace;
        let mut report = ShutdownReport {
            stop_signals: self.resources(),
            ..Default::default()
        };

        info!(
            watches = self.handles.len(),
            resources = report.stop_signals,
            "stopping watches"
        );
        for handle in &self.handles {
            handle.stop();
        }

        for mut handle in self.handles {
            let joined = timeout_at(deadline, handle.join()).await;
            match joined {
                Ok(Ok(exit)) => {
                    report.stopped += 1;
                    report.locks_released += exit.locks_released;
                }
                Ok(Err(e)) => {
                    error!(entity = %handle.entity(), "watch task failed: {}", e);
                    report.failed.push(handle.entity().clone());
                }
                Err(_) => {
                    warn!(entity = %handle.entity(), "watch did not stop within {:?}, aborting", self.grace);
                    handle.abort();
                    report.timed_out.push(handle.entity().clone());
                }
            }
        }

        info!(
            stopped = report.stopped,
            locks_released = report.locks_released,
            timed_out = report.timed_out.len(),
            "all watches stopped"
        );
        report
    }
}
