//! TTL cache with in-flight request coalescing.
//!
//! Each key has at most one outstanding fetch. The first caller (the leader) builds a
//! `Shared` future and spawns a driver for it; later callers clone the same future and await
//! the broadcast result. The driver keeps polling even if every waiter goes away, so the
//! in-flight slot is always released. Successful results are stored with the TTL of their
//! query class; failures reach the current waiters and are never stored. Zero-TTL results are
//! never stored either. Expired entries are swept by `purge_expired` and, once the map passes
//! `SWEEP_THRESHOLD`, on every miss.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::CacheTtlConfig;
use crate::error::Result;

/// Query classes. Each maps to one volatility TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    JobStatus,
    JobLog,
    JobDefinition,
    Workstations,
    DependencyChain,
    Impact,
    CriticalJobs,
    CommonDependencies,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::JobStatus => "job_status",
            QueryType::JobLog => "job_log",
            QueryType::JobDefinition => "job_definition",
            QueryType::Workstations => "workstations",
            QueryType::DependencyChain => "dependency_chain",
            QueryType::Impact => "impact",
            QueryType::CriticalJobs => "critical_jobs",
            QueryType::CommonDependencies => "common_dependencies",
        }
    }

    pub fn ttl(&self, ttls: &CacheTtlConfig) -> Duration {
        let secs = match self {
            QueryType::JobStatus => ttls.status_secs,
            QueryType::JobLog => ttls.log_secs,
            QueryType::JobDefinition | QueryType::Workstations => ttls.definition_secs,
            QueryType::DependencyChain
            | QueryType::Impact
            | QueryType::CriticalJobs
            | QueryType::CommonDependencies => ttls.dependency_secs,
        };
        Duration::from_secs(secs)
    }
}

/// (query type, canonical-arguments hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub query: QueryType,
    pub args_hash: u64,
}

impl CacheKey {
    /// Arguments are trimmed and hashed in the order given. Callers pass set-like arguments
    /// already sorted.
    pub fn new(query: QueryType, args: &[&str]) -> Self {
        let canonical = args
            .iter()
            .map(|a| a.trim())
            .collect::<Vec<_>>()
            .join("\u{1f}");
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        Self {
            query,
            args_hash: hasher.finish(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedResult {
    value: Arc<Value>,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedResult {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }
}

/// Entry count above which a miss also sweeps expired entries.
const SWEEP_THRESHOLD: usize = 1_024;

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<Value>>>>;

pub struct QueryCache {
    entries: Arc<DashMap<CacheKey, CachedResult>>,
    inflight: Arc<DashMap<CacheKey, SharedFetch>>,
    ttls: CacheTtlConfig,
}

impl QueryCache {
    pub fn new(ttls: CacheTtlConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            inflight: Arc::new(DashMap::new()),
            ttls,
        }
    }

    fn fresh(&self, key: &CacheKey) -> Option<Arc<Value>> {
        let hit = self
            .entries
            .get(key)
            .map(|e| (Arc::clone(&e.value), e.is_fresh()));
        match hit {
            Some((value, true)) => Some(value),
            Some((_, false)) => {
                self.entries.remove_if(key, |_, e| !e.is_fresh());
                None
            }
            None => None,
        }
    }

    /// Return the cached value for `key`, join the in-flight fetch, or start one with `fetch`.
    pub async fn get_or_fetch<F, Fut>(&self, key: CacheKey, fetch: F) -> Result<Arc<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        if let Some(hit) = self.fresh(&key) {
            trace!(target: "opsflow::graph", query = key.query.as_str(), "cache hit");
            return Ok(hit);
        }

        let shared = match self.inflight.entry(key) {
            Entry::Occupied(slot) => {
                debug!(target: "opsflow::graph", query = key.query.as_str(), "joining in-flight fetch");
                slot.get().clone()
            }
            Entry::Vacant(slot) => {
                // A fetch may have finished between the first check and taking the slot.
                if let Some(hit) = self.fresh(&key) {
                    return Ok(hit);
                }
                let entries = Arc::clone(&self.entries);
                let inflight = Arc::clone(&self.inflight);
                let ttl = key.query.ttl(&self.ttls);
                let pending = fetch();
                let fut = async move {
                    let result = pending.await.map(Arc::new);
                    if let (Ok(value), false) = (&result, ttl.is_zero()) {
                        entries.insert(
                            key,
                            CachedResult {
                                value: Arc::clone(value),
                                fetched_at: Instant::now(),
                                ttl,
                            },
                        );
                    }
                    inflight.remove(&key);
                    result
                }
                .boxed()
                .shared();
                slot.insert(fut.clone());
                if self.entries.len() >= SWEEP_THRESHOLD {
                    self.purge_expired();
                }
                debug!(target: "opsflow::graph", query = key.query.as_str(), "cache miss; fetching");
                tokio::spawn(fut.clone());
                fut
            }
        };

        shared.await
    }

    /// Drop every cached entry of `query`. In-flight fetches are unaffected.
    pub fn invalidate(&self, query: QueryType) {
        self.entries.retain(|k, _| k.query != query);
    }

    /// Drop every entry past its TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_fresh());
        before.saturating_sub(self.entries.len())
    }

    pub fn remove(&self, key: &CacheKey) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}
