//! Graph Query Service: dependency and impact queries over the external job graph.
//!
//! Every query goes through [`QueryCache`], keyed by query type and canonical arguments.
//! Ranking uses downstream fan-out as a degree proxy for centrality, since the graph is
//! queried on demand and never loaded into memory.

mod backend;
mod cache;

pub use backend::{DependencyEntry, EdgeKind, GraphBackend, HttpGraphBackend, InMemoryGraph, NodeKind};
pub use cache::{CacheKey, QueryCache, QueryType};

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::CoreConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub job: String,
    /// Jobs that depend on `job` directly.
    pub direct: Vec<String>,
    /// Every job downstream of `job`, sorted by name.
    pub transitive: Vec<String>,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalJob {
    pub job: String,
    pub fan_out: usize,
}

pub struct GraphQueryService {
    backend: Arc<dyn GraphBackend>,
    cache: QueryCache,
    critical_threshold: usize,
}

impl GraphQueryService {
    pub fn new(backend: Arc<dyn GraphBackend>, config: &CoreConfig) -> Self {
        Self {
            backend,
            cache: QueryCache::new(config.cache_ttl.clone()),
            critical_threshold: config.graph_critical_threshold,
        }
    }

    /// Fetch-or-coalesce for callers outside the service (the orchestrator's status lookups).
    pub async fn cached<F, Fut>(&self, query: QueryType, args: &[&str], fetch: F) -> Result<Arc<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.cache
            .get_or_fetch(CacheKey::new(query, args), fetch)
            .await
    }

    async fn typed<T, F, Fut>(&self, query: QueryType, args: &[&str], fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(Arc<dyn GraphBackend>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let pending = fetch(Arc::clone(&self.backend));
        let value = self
            .cached(query, args, move || async move {
                Ok(serde_json::to_value(pending.await?)?)
            })
            .await?;
        Ok(T::deserialize(value.as_ref())?)
    }

    /// Upstream transitive closure ordered by depth, then name. Unknown jobs yield an empty list.
    pub async fn dependency_chain(&self, job: &str) -> Result<Vec<DependencyEntry>> {
        let owned = job.trim().to_string();
        self.typed(QueryType::DependencyChain, &[job], move |backend| async move {
            let mut chain = backend.ancestors_of(&owned, EdgeKind::DependsOn).await?;
            chain.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.job.cmp(&b.job)));
            Ok(chain)
        })
        .await
    }

    /// Downstream closure of `job`; `critical` when it exceeds `graph_critical_threshold`.
    pub async fn impact_analysis(&self, job: &str) -> Result<ImpactReport> {
        let owned = job.trim().to_string();
        let threshold = self.critical_threshold;
        self.typed(QueryType::Impact, &[job], move |backend| async move {
            let downstream = backend.descendants_of(&owned, EdgeKind::DependsOn).await?;
            let mut direct: Vec<String> = downstream
                .iter()
                .filter(|e| e.depth == 1)
                .map(|e| e.job.clone())
                .collect();
            direct.sort();
            let mut transitive: Vec<String> = downstream.into_iter().map(|e| e.job).collect();
            transitive.sort();
            let critical = transitive.len() > threshold;
            Ok(ImpactReport {
                job: owned,
                direct,
                transitive,
                critical,
            })
        })
        .await
    }

    /// Top `limit` jobs by downstream fan-out, ties broken by name. Jobs nothing depends on
    /// are not ranked.
    pub async fn critical_jobs(&self, limit: usize) -> Result<Vec<CriticalJob>> {
        let mut ranked: Vec<CriticalJob> = self
            .typed(QueryType::CriticalJobs, &[], |backend| async move {
                let counts = backend
                    .degree_counts(NodeKind::Job, EdgeKind::DependsOn)
                    .await?;
                let mut ranked: Vec<CriticalJob> = counts
                    .into_iter()
                    .filter(|(_, fan_out)| *fan_out > 0)
                    .map(|(job, fan_out)| CriticalJob { job, fan_out })
                    .collect();
                ranked.sort_by(|a, b| b.fan_out.cmp(&a.fan_out).then_with(|| a.job.cmp(&b.job)));
                Ok(ranked)
            })
            .await?;
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Intersection of the upstream sets of every job in `jobs`.
    pub async fn common_dependencies(&self, jobs: &[String]) -> Result<BTreeSet<String>> {
        let canonical: BTreeSet<String> = jobs
            .iter()
            .map(|j| j.trim().to_string())
            .filter(|j| !j.is_empty())
            .collect();
        if canonical.is_empty() {
            return Ok(BTreeSet::new());
        }
        let names: Vec<String> = canonical.into_iter().collect();
        let args: Vec<&str> = names.iter().map(String::as_str).collect();
        let owned = names.clone();
        self.typed(QueryType::CommonDependencies, &args, move |backend| async move {
            let sets = try_join_all(owned.iter().map(|job| {
                let backend = Arc::clone(&backend);
                async move {
                    let up = backend.ancestors_of(job, EdgeKind::DependsOn).await?;
                    Ok::<BTreeSet<String>, crate::error::OpsError>(
                        up.into_iter().map(|e| e.job).collect(),
                    )
                }
            }))
            .await?;
            let mut iter = sets.into_iter();
            let first = iter.next().unwrap_or_default();
            Ok(iter.fold(first, |acc, s| acc.intersection(&s).cloned().collect()))
        })
        .await
    }

    /// Workstations `job` runs on (direct RUNS_ON neighbours).
    pub async fn workstations_for(&self, job: &str) -> Result<Vec<String>> {
        let owned = job.trim().to_string();
        self.typed(QueryType::Workstations, &[job], move |backend| async move {
            let mut names: Vec<String> = backend
                .ancestors_of(&owned, EdgeKind::RunsOn)
                .await?
                .into_iter()
                .filter(|e| e.depth == 1)
                .map(|e| e.job)
                .collect();
            names.sort();
            Ok(names)
        })
        .await
    }

    pub fn invalidate(&self, query: QueryType) {
        debug!(target: "opsflow::graph", query = query.as_str(), "invalidating cached results");
        self.cache.invalidate(query);
    }

    /// Drop one cached result, e.g. a status answer that failed validation.
    pub fn invalidate_key(&self, query: QueryType, args: &[&str]) {
        self.cache.remove(&CacheKey::new(query, args));
    }

    /// Sweep results past their TTL. The daemon calls this on its GC tick.
    pub fn purge_expired(&self) -> usize {
        let removed = self.cache.purge_expired();
        if removed > 0 {
            debug!(target: "opsflow::graph", removed, "purged expired cached results");
        }
        removed
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
