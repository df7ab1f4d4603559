//! Consul HTTP API client.
//!
//! Health is read with blocking queries (`index` + `wait`), locks are KV
//! keys acquired through TTL sessions with `Behavior = release`, so a lock
//! disappears on its own when its holder stops renewing.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use reqwest::Method;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::Catalog;
use super::CheckStatus;
use super::DiscoveryScope;
use super::Entity;
use super::Fixture;
use super::HealthState;
use super::Observation;
use super::QueryIndex;
use super::Registry;
use crate::RegistryError;
use crate::Result;
use crate::Settings;

pub(crate) const INDEX_HEADER: &str = "X-Consul-Index";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Consul rejects session TTLs below 10s
const MIN_SESSION_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ApiHealthCheck {
    pub node: String,
    #[serde(rename = "CheckID")]
    pub check_id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub output: String,
    #[serde(default, rename = "ServiceID")]
    pub service_id: String,
}

impl From<ApiHealthCheck> for CheckStatus {
    fn from(c: ApiHealthCheck) -> Self {
        CheckStatus {
            status: HealthState::from_status(&c.status),
            node: c.node,
            check_id: c.check_id,
            name: c.name,
            service_id: c.service_id,
            output: c.output,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ApiServiceEntry {
    #[serde(default)]
    pub checks: Vec<ApiHealthCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiNode {
    node: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ApiAgentService {
    pub service: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiAgentSelf {
    config: ApiAgentSelfConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiAgentSelfConfig {
    node_name: String,
}

#[derive(Debug, Deserialize)]
struct ApiSession {
    #[serde(rename = "ID")]
    id: String,
}

/// Service health: worst state over every check of every instance, node
/// checks included. A service without instances is critical.
pub(crate) fn observation_from_service_entries(entries: Vec<ApiServiceEntry>) -> Observation {
    if entries.is_empty() {
        return Observation::new(HealthState::Critical, vec![]);
    }

    // Node level checks are repeated for every instance on the same node
    let mut seen = BTreeSet::new();
    let checks = entries
        .into_iter()
        .flat_map(|e| e.checks)
        .filter(|c| seen.insert((c.node.clone(), c.check_id.clone())))
        .map(CheckStatus::from)
        .collect();
    Observation::from_checks(checks)
}

pub(crate) fn observation_from_node_checks(checks: Vec<ApiHealthCheck>) -> Observation {
    Observation::from_checks(checks.into_iter().map(CheckStatus::from).collect())
}

/// Merges the tags of every local instance per service name
pub(crate) fn services_from_agent(services: HashMap<String, ApiAgentService>) -> BTreeMap<String, Vec<String>> {
    let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for service in services.into_values() {
        merged
            .entry(service.service)
            .or_default()
            .extend(service.tags.unwrap_or_default());
    }
    merged.into_iter().map(|(name, tags)| (name, tags.into_iter().collect())).collect()
}

pub(crate) fn parse_index(headers: &HeaderMap) -> Option<QueryIndex> {
    headers.get(INDEX_HEADER)?.to_str().ok()?.trim().parse().ok()
}

/// Server side wait plus the jitter Consul may add (wait / 16) and a margin
/// for the round trip.
pub(crate) fn blocking_timeout(wait: Duration) -> Duration {
    wait + wait / 16 + Duration::from_secs(5)
}

pub struct ConsulRegistry {
    http: reqwest::Client,
    base_url: String,
    agent_id: String,
    lock_ttl: Duration,
    /// Lock key -> session backing it
    sessions: DashMap<String, String>,
}

impl ConsulRegistry {
    pub fn new(
        base_url: impl Into<String>,
        agent_id: impl Into<String>,
        lock_ttl: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(RegistryError::Http)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent_id: agent_id.into(),
            lock_ttl: lock_ttl.max(MIN_SESSION_TTL),
            sessions: DashMap::new(),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(settings.agent.consul_url(), &settings.agent.agent_id, settings.lock.ttl())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .query(query)
            .timeout(timeout);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(RegistryError::Http)?;
        if !response.status().is_success() {
            return Err(RegistryError::UnexpectedStatus {
                path: path.to_string(),
                status: response.status().as_u16(),
            }
            .into());
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<(T, HeaderMap)> {
        let response = self.send(Method::GET, path, query, None, timeout).await?;
        let headers = response.headers().clone();
        let body = response
            .json::<T>()
            .await
            .map_err(|e| RegistryError::Decode(format!("{}: {}", path, e)))?;
        Ok((body, headers))
    }

    async fn put_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let response = self.send(Method::PUT, path, query, body, REQUEST_TIMEOUT).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RegistryError::Decode(format!("{}: {}", path, e)).into())
    }

    async fn put(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<()> {
        self.send(Method::PUT, path, query, body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    async fn create_session(
        &self,
        key: &str,
    ) -> Result<String> {
        let body = json!({
            "Name": format!("{}:{}", self.agent_id, key),
            "TTL": format!("{}s", self.lock_ttl.as_secs()),
            "Behavior": "release",
            "LockDelay": "0s",
        });
        let session: ApiSession = self.put_json("/v1/session/create", &[], Some(body)).await?;
        debug!(key, session = %session.id, "created lock session");
        Ok(session.id)
    }

    /// `Ok(false)` when the session no longer exists
    async fn renew_session(
        &self,
        session: &str,
    ) -> Result<bool> {
        match self.put(&format!("/v1/session/renew/{}", session), &[], None).await {
            Ok(()) => Ok(true),
            Err(crate::Error::Registry(RegistryError::UnexpectedStatus { status, .. }))
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn destroy_session(
        &self,
        session: &str,
    ) -> Result<()> {
        self.put(&format!("/v1/session/destroy/{}", session), &[], None).await
    }

    /// The live session cached for `key`, or a fresh one
    async fn session_for(
        &self,
        key: &str,
    ) -> Result<String> {
        let cached = self.sessions.get(key).map(|s| s.value().clone());
        if let Some(session) = cached {
            if self.renew_session(&session).await? {
                return Ok(session);
            }
            self.sessions.remove(key);
        }
        let session = self.create_session(key).await?;
        self.sessions.insert(key.to_string(), session.clone());
        Ok(session)
    }

    async fn local_node_name(&self) -> Result<String> {
        let (agent, _): (ApiAgentSelf, _) = self.get_json("/v1/agent/self", &[], REQUEST_TIMEOUT).await?;
        Ok(agent.config.node_name)
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn leader(&self) -> Result<String> {
        let (leader, _): (String, _) = self.get_json("/v1/status/leader", &[], REQUEST_TIMEOUT).await?;
        if leader.is_empty() {
            return Err(RegistryError::NoLeader.into());
        }
        Ok(leader)
    }

    async fn query_health(
        &self,
        entity: &Entity,
        since: QueryIndex,
        wait: Duration,
    ) -> Result<(Observation, QueryIndex)> {
        let mut query = vec![
            ("index", since.to_string()),
            ("wait", format!("{}ms", wait.as_millis())),
        ];
        let timeout = blocking_timeout(wait);

        let (observation, headers, path) = match entity {
            Entity::Service { name, tag } => {
                if let Some(tag) = tag {
                    query.push(("tag", tag.clone()));
                }
                let path = format!("/v1/health/service/{}", name);
                let (entries, headers) = self.get_json::<Vec<ApiServiceEntry>>(&path, &query, timeout).await?;
                (observation_from_service_entries(entries), headers, path)
            }
            Entity::Node { name } => {
                let path = format!("/v1/health/node/{}", name);
                let (checks, headers) = self.get_json::<Vec<ApiHealthCheck>>(&path, &query, timeout).await?;
                (observation_from_node_checks(checks), headers, path)
            }
        };

        let index = parse_index(&headers).ok_or(RegistryError::MissingIndex { path })?;
        trace!(entity = %entity, since, index, state = %observation.state, "blocking query returned");
        Ok((observation, index))
    }

    async fn query_catalog(
        &self,
        scope: DiscoveryScope,
    ) -> Result<Catalog> {
        match scope {
            DiscoveryScope::Cluster => {
                let (services, _): (HashMap<String, Option<Vec<String>>>, _) =
                    self.get_json("/v1/catalog/services", &[], REQUEST_TIMEOUT).await?;
                let nodes = match self
                    .get_json::<Vec<ApiNode>>("/v1/catalog/nodes", &[], REQUEST_TIMEOUT)
                    .await
                {
                    Ok((nodes, _)) => nodes.into_iter().map(|n| n.node).collect(),
                    Err(e) => {
                        warn!("Error getting nodes from catalog: {}", e);
                        vec![]
                    }
                };
                Ok(Catalog {
                    services: services
                        .into_iter()
                        .map(|(name, tags)| (name, tags.unwrap_or_default()))
                        .collect(),
                    nodes,
                })
            }
            DiscoveryScope::LocalAgent => {
                let (services, _): (HashMap<String, ApiAgentService>, _) =
                    self.get_json("/v1/agent/services", &[], REQUEST_TIMEOUT).await?;
                let nodes = match self.local_node_name().await {
                    Ok(node) => vec![node],
                    Err(e) => {
                        warn!("Error getting local node name: {}", e);
                        vec![]
                    }
                };
                Ok(Catalog {
                    services: services_from_agent(services),
                    nodes,
                })
            }
        }
    }

    async fn acquire_lock(
        &self,
        key: &str,
    ) -> Result<bool> {
        let session = self.session_for(key).await?;
        let acquired: bool = self
            .put_json(
                &format!("/v1/kv/{}", key),
                &[("acquire", session.clone())],
                Some(json!({ "agent": self.agent_id })),
            )
            .await?;

        if !acquired {
            // Do not keep idle sessions around while another agent holds the key
            self.sessions.remove(key);
            if let Err(e) = self.destroy_session(&session).await {
                debug!(key, "could not destroy unused session: {}", e);
            }
        }
        Ok(acquired)
    }

    async fn renew_lock(
        &self,
        key: &str,
    ) -> Result<bool> {
        let cached = self.sessions.get(key).map(|s| s.value().clone());
        match cached {
            Some(session) => {
                let alive = self.renew_session(&session).await?;
                if !alive {
                    self.sessions.remove(key);
                }
                Ok(alive)
            }
            None => Ok(false),
        }
    }

    async fn release_lock(
        &self,
        key: &str,
    ) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(key) else {
            return Ok(());
        };

        let released: Result<bool> = self
            .put_json(&format!("/v1/kv/{}", key), &[("release", session.clone())], None)
            .await;
        let destroyed = self.destroy_session(&session).await;
        released?;
        destroyed
    }

    async fn register_fixtures(
        &self,
        fixtures: &[Fixture],
    ) -> Result<()> {
        for fixture in fixtures {
            match fixture {
                Fixture::Service {
                    name,
                    tags,
                    port,
                    script,
                    interval,
                } => {
                    let body = json!({
                        "Name": name,
                        "Tags": tags,
                        "Port": port,
                        "Check": { "Args": ["sh", "-c", script], "Interval": interval },
                    });
                    self.put("/v1/agent/service/register", &[], Some(body)).await?;
                }
                Fixture::Check { name, script, interval } => {
                    let body = json!({
                        "Name": name,
                        "Args": ["sh", "-c", script],
                        "Interval": interval,
                    });
                    self.put("/v1/agent/check/register", &[], Some(body)).await?;
                }
            }
        }
        Ok(())
    }

    async fn deregister_fixtures(
        &self,
        fixtures: &[Fixture],
    ) -> Result<()> {
        let mut first_error = None;
        for fixture in fixtures {
            let path = match fixture {
                Fixture::Service { name, .. } => format!("/v1/agent/service/deregister/{}", name),
                Fixture::Check { name, .. } => format!("/v1/agent/check/deregister/{}", name),
            };
            if let Err(e) = self.put(&path, &[], None).await {
                warn!("failed to deregister {}: {}", fixture.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
