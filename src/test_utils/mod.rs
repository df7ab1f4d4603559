//! Shared helpers for unit tests: scripted handlers and registries, event
//! and option builders.
mod builders;
mod handlers;
mod registry;

pub(crate) use builders::*;
pub(crate) use handlers::*;
pub(crate) use registry::*;
