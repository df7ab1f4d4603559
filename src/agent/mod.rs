//! Agent bootstrap.
//!
//! Connects to the registry, discovers what to watch, starts one watch loop
//! per entity and, once the shutdown signal fires, stops everything and
//! gives back every lock and dev fixture it took.

mod dev_fixtures;
mod signals;
pub use dev_fixtures::*;
pub use signals::*;


use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::utils::async_task::retry_with_backoff;
use crate::Catalog;
use crate::ChangeThreshold;
use crate::DiscoveryScope;
use crate::Entity;
use crate::Error;
use crate::Fixture;
use crate::HandlerDispatcher;
use crate::HandlerRegistry;
use crate::HandlerSet;
use crate::LockCoordinator;
use crate::Registry;
use crate::Result;
use crate::Settings;
use crate::ShutdownCoordinator;
use crate::ShutdownReport;
use crate::WatchLoop;
use crate::WatchOptions;

/// One entity to watch, with everything that varies per entity
#[derive(Debug, Clone)]
pub struct WatchPlan {
    pub entity: Entity,
    pub threshold: ChangeThreshold,
    pub handlers: HandlerSet,
}

pub struct Agent<R>
where R: Registry
{
    settings: Settings,
    registry: Arc<R>,
    handlers: HandlerRegistry,
    locks: Option<Arc<LockCoordinator<R>>>,
    fixtures: Vec<Fixture>,
}

impl<R> Agent<R>
where R: Registry
{
    pub fn new(
        settings: Settings,
        registry: Arc<R>,
        handlers: HandlerRegistry,
    ) -> Self {
        let locks = settings
            .agent
            .global_mode
            .then(|| Arc::new(LockCoordinator::new(registry.clone(), &settings.lock, settings.retry.lock)));

        Self {
            settings,
            registry,
            handlers,
            locks,
            fixtures: Vec::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn locks(&self) -> Option<&Arc<LockCoordinator<R>>> {
        self.locks.as_ref()
    }

    pub fn scope(&self) -> DiscoveryScope {
        if self.settings.agent.global_mode {
            DiscoveryScope::Cluster
        } else {
            DiscoveryScope::LocalAgent
        }
    }

    /// Polls the registry until it reports a leader.
    ///
    /// # Errors
    /// `Error::Fatal` once the startup retry policy is exhausted.
    pub async fn wait_for_registry(&self) -> Result<String> {
        let registry = &self.registry;
        match retry_with_backoff(|| registry.leader(), &self.settings.retry.startup).await {
            Ok(leader) => {
                info!(leader = %leader, "connected to registry");
                Ok(leader)
            }
            Err(e) => {
                error!("error connecting to registry: {}", e);
                Err(Error::Fatal(format!(
                    "registry at {} is unreachable: {}",
                    self.settings.agent.consul_address, e
                )))
            }
        }
    }

    /// Registers the demo fixtures when dev mode is on
    pub async fn register_dev_fixtures(&mut self) -> Result<()> {
        if !self.settings.agent.dev_mode {
            return Ok(());
        }
        let fixtures = dev_fixtures();
        info!(count = fixtures.len(), "dev mode: registering test services");
        // Remember them first so a partial registration is still cleaned up
        self.fixtures = fixtures;
        self.registry.register_fixtures(&self.fixtures).await
    }

    pub async fn discover(&self) -> Result<Catalog> {
        match self.scope() {
            DiscoveryScope::Cluster => info!("running in global mode, discovering all services and nodes"),
            DiscoveryScope::LocalAgent => info!("running in local mode, discovering the local agent's services and node"),
        }
        let catalog = self.registry.query_catalog(self.scope()).await?;
        for (service, tags) in &catalog.services {
            info!(service = %service, tags = ?tags, "service found");
        }
        info!(nodes = ?catalog.nodes, "nodes found");
        Ok(catalog)
    }

    /// Turns a catalog into watch plans.
    ///
    /// Services with `distinct_tags` get one watch per non-ignored tag;
    /// every other service and every node gets a single watch.
    pub fn plan(
        &self,
        catalog: &Catalog,
    ) -> Result<Vec<WatchPlan>> {
        let mut plans = Vec::new();
        let mut seen = HashSet::new();

        for (service, tags) in &catalog.services {
            let config = self.settings.service(service);
            let threshold = self.settings.service_threshold(service)?;
            let handlers = self
                .handlers
                .select(config.and_then(|c| c.handlers.as_deref()))?;

            let entities: Vec<Entity> = match config {
                Some(c) if c.distinct_tags && !tags.is_empty() => tags
                    .iter()
                    .filter(|tag| {
                        let ignored = c.is_ignored(tag);
                        if ignored {
                            debug!(service = %service, tag = %tag, "tag ignored");
                        }
                        !ignored
                    })
                    .map(|tag| Entity::service(service.as_str(), Some(tag.as_str())))
                    .collect(),
                _ => vec![Entity::service(service.as_str(), None)],
            };

            for entity in entities {
                if seen.insert(entity.clone()) {
                    plans.push(WatchPlan {
                        entity,
                        threshold,
                        handlers: handlers.clone(),
                    });
                }
            }
        }

        let threshold = self.settings.node_threshold()?;
        let handlers = self.handlers.select(None)?;
        for node in &catalog.nodes {
            let entity = Entity::node(node.as_str());
            if seen.insert(entity.clone()) {
                plans.push(WatchPlan {
                    entity,
                    threshold,
                    handlers: handlers.clone(),
                });
            }
        }

        Ok(plans)
    }

    fn options(
        &self,
        plan: &WatchPlan,
    ) -> WatchOptions<R> {
        WatchOptions {
            threshold: plan.threshold,
            seed: self.settings.watch.seed_state,
            wait_time: self.settings.watch.wait_time(),
            error_ceiling: self.settings.watch.error_ceiling(),
            retry: self.settings.retry.registry,
            registry: self.registry.clone(),
            dispatcher: Arc::new(HandlerDispatcher::new(
                plan.handlers.clone(),
                self.settings.watch.handler_timeout(),
            )),
            locks: self.locks.clone(),
        }
    }

    /// Spawns one watch loop per plan
    pub fn start(
        &self,
        plans: Vec<WatchPlan>,
    ) -> ShutdownCoordinator {
        let mut coordinator = ShutdownCoordinator::new(self.settings.shutdown.grace_period());
        for plan in plans {
            debug!(entity = %plan.entity, handlers = %plan.handlers.key(), "starting watch");
            let options = self.options(&plan);
            coordinator.register(WatchLoop::new(plan.entity, options).spawn());
        }
        info!(watches = coordinator.active(), "all watches started");
        coordinator
    }

    /// Stops every watch, then sweeps locks left behind by watches that
    /// had to be aborted and removes dev fixtures.
    pub async fn stop(
        &mut self,
        coordinator: ShutdownCoordinator,
    ) -> ShutdownReport {
        if !self.fixtures.is_empty() {
            info!("dev mode: deregistering test services");
            if let Err(e) = self.registry.deregister_fixtures(&self.fixtures).await {
                warn!("failed to deregister test services: {}", e);
            }
            self.fixtures.clear();
        }

        info!("releasing locks");
        let mut report = coordinator.shutdown().await;

        if let Some(locks) = &self.locks {
            let swept = locks.release_all().await;
            if swept > 0 {
                warn!(swept, "released locks left by aborted watches");
            }
            report.locks_released += swept;
        }
        report
    }

    /// Undoes startup before any watch runs: only the fixtures registered
    /// so far need cleaning up.
    async fn abort_startup(
        &mut self,
        e: Error,
    ) -> Error {
        error!("startup failed: {}", e);
        let coordinator = ShutdownCoordinator::new(self.settings.shutdown.grace_period());
        self.stop(coordinator).await;
        e
    }

    /// Full lifecycle: fixtures, discovery, watches, then an orderly stop
    /// once `shutdown` fires (or its sender goes away).
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<()>,
    ) -> Result<ShutdownReport> {
        if let Err(e) = self.register_dev_fixtures().await {
            return Err(self.abort_startup(e).await);
        }

        let plans = match self.discover().await.and_then(|catalog| self.plan(&catalog)) {
            Ok(plans) => plans,
            Err(e) => return Err(self.abort_startup(e).await),
        };
        let coordinator = self.start(plans);

        if shutdown.changed().await.is_err() {
            warn!("shutdown sender dropped, stopping");
        }
        info!("got shutdown signal, shutting down");

        Ok(self.stop(coordinator).await)
    }
}
