//! Cluster health alerting agent.
//!
//! Watches services and nodes registered in a Consul-style registry and
//! notifies pluggable handlers when their health changes. Many agents can
//! run side by side in global mode; a cluster-wide lock per entity makes
//! sure only one of them alerts.

mod agent;
mod config;
mod core;
mod errors;
mod handlers;
pub mod metrics;
mod registry;
pub(crate) mod utils;

pub use agent::*;
pub use config::*;
pub use self::core::*;
pub use errors::*;
pub use handlers::*;
pub use registry::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
