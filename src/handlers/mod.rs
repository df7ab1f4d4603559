//! Pluggable notification sinks.
//!
//! Handlers are built once from the `[[handlers]]` config section. Each
//! watched entity gets a [`HandlerSet`]: the subset of handlers its service
//! selected, kept in configured order. The set's [`HandlerSet::key`] is part of
//! the fleet-wide lock key, so agents with the same handler selection
//! compete for the same lock.

mod file_handler;
mod log_handler;
pub use file_handler::*;
pub use log_handler::*;


use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::HandlerConfig;
use crate::HandlerError;
use crate::HandlerKind;
use crate::Result;
use crate::Transition;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Configured name, unique per agent
    fn name(&self) -> &str;

    /// Delivers one transition
    async fn notify(
        &self,
        transition: &Transition,
    ) -> std::result::Result<(), HandlerError>;
}

/// Ordered selection of handlers for one entity
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerSet {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Self {
        Self { handlers }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.handlers.iter()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Order independent identity of the set: sorted names joined by `+`,
    /// or `none` for the empty set.
    pub fn key(&self) -> String {
        let mut names = self.names();
        if names.is_empty() {
            return "none".to_string();
        }
        names.sort_unstable();
        names.join("+")
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("HandlerSet").field("handlers", &self.names()).finish()
    }
}

/// All configured handlers, by name and in configured order
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    order: Vec<String>,
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Builds every configured handler. Configuration has already been
    /// validated, so this only fails on construction problems.
    pub fn from_config(configs: &[HandlerConfig]) -> Result<Self> {
        let mut registry = Self::default();
        for config in configs {
            let handler: Arc<dyn Handler> = match config.kind {
                HandlerKind::Log => Arc::new(LogHandler::new(&config.name, config.level.as_deref())?),
                HandlerKind::File => {
                    let path = config.path.clone().ok_or_else(|| {
                        crate::Error::InvalidConfig(format!("handler '{}': file handlers require a path", config.name))
                    })?;
                    Arc::new(FileHandler::new(&config.name, path))
                }
            };
            registry.insert(handler);
        }
        Ok(registry)
    }

    /// Adds a handler, replacing any handler with the same name
    pub fn insert(
        &mut self,
        handler: Arc<dyn Handler>,
    ) {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_none() {
            self.order.push(name);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Selects handlers by name, in configured order. `None` selects all.
    ///
    /// # Errors
    /// `HandlerError::Unknown` when a name is not configured.
    pub fn select(
        &self,
        names: Option<&[String]>,
    ) -> Result<HandlerSet> {
        let Some(names) = names else {
            return Ok(HandlerSet::new(
                self.order.iter().filter_map(|n| self.handlers.get(n).cloned()).collect(),
            ));
        };

        if let Some(unknown) = names.iter().find(|n| !self.handlers.contains_key(n.as_str())) {
            return Err(HandlerError::Unknown(unknown.clone()).into());
        }

        Ok(HandlerSet::new(
            self.order
                .iter()
                .filter(|n| names.contains(n))
                .filter_map(|n| self.handlers.get(n).cloned())
                .collect(),
        ))
    }
}
