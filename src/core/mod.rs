//! The watch-and-dedupe engine.
//!
//! One [`WatchLoop`] per watched entity drives
//! `registry -> ChangeDetector -> (LockCoordinator) -> HandlerDispatcher`.
//! The [`ShutdownCoordinator`] owns every loop's [`WatchHandle`] and stops
//! them together.

mod detector;
mod dispatcher;
mod event;
mod lock;
mod shutdown;
mod watch;

pub use detector::*;
pub use dispatcher::*;
pub use event::*;
pub use lock::*;
pub use shutdown::*;
pub use watch::*;

#[cfg(test)]
mod dispatcher_test;
