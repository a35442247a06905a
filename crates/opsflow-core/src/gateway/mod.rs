//! Resilient client gateway: the only path from the core to external systems.
//!
//! - **Lazy, once-only clients**: one pooled `reqwest::Client` per [`Target`], built on first
//!   use behind a per-target `tokio::sync::OnceCell`. Concurrent first callers all wait on the
//!   same initializer; no duplicate client is ever built or discarded.
//! - **Circuit breaking**: every call passes through the target's [`CircuitBreaker`] before the
//!   client is even looked up, so an open circuit fails fast without touching the network.
//! - **TLS**: verification follows `tls.verify`; [`Gateway::new`] refuses an unsafe config.

mod breaker;
pub mod llm;
pub mod workload;

pub use breaker::{BreakerPermit, BreakerState, CircuitBreaker};
pub use llm::{ChatCompletionsModel, Completion, CompletionRequest, LanguageModel};
pub use workload::{HttpWorkloadApi, WorkloadApi, WorkloadOp};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::error::{OpsError, Result};

/// External systems reachable through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Workload,
    LanguageModel,
    Graph,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Workload => "workload",
            Target::LanguageModel => "language_model",
            Target::Graph => "graph",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pooled HTTP client bound to one target's base URL.
#[derive(Debug)]
pub struct ClientHandle {
    target: Target,
    http: reqwest::Client,
    base_url: String,
    created_at: DateTime<Utc>,
}

impl ClientHandle {
    pub fn target(&self) -> Target {
        self.target
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Join `path` onto the base URL.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Failure reported by a backend. Never carries response bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Connect/timeout/5xx/429: retryable and counted by the breaker.
    Transient(String),
    /// Non-retryable answer (4xx). The upstream is healthy; the breaker treats it as success.
    Rejected { status: u16 },
}

impl UpstreamError {
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            UpstreamError::Transient(format!("status {}", status.as_u16()))
        } else {
            UpstreamError::Rejected {
                status: status.as_u16(),
            }
        }
    }

    /// Classify a reqwest error. The URL (which may embed credentials) is stripped first.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        let e = e.without_url();
        if let Some(status) = e.status() {
            return Self::from_status(status);
        }
        if e.is_timeout() {
            UpstreamError::Transient("timed out".to_string())
        } else if e.is_connect() {
            UpstreamError::Transient("connection failed".to_string())
        } else if e.is_decode() {
            UpstreamError::Transient("undecodable response".to_string())
        } else {
            UpstreamError::Transient(e.to_string())
        }
    }
}

/// Connection settings derived from [`CoreConfig`].
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub verify_tls: bool,
    pub pool_max_idle_per_host: usize,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub workload_url: String,
    pub llm_url: String,
    pub graph_url: String,
}

impl GatewaySettings {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            verify_tls: config.tls.verify,
            pool_max_idle_per_host: config.pool.max_idle_per_host,
            timeout: Duration::from_millis(config.pool.timeout_ms),
            failure_threshold: config.breaker.failure_threshold,
            cooldown: Duration::from_millis(config.breaker.cooldown_ms),
            workload_url: config.workload.base_url.clone(),
            llm_url: config.llm.base_url.clone(),
            graph_url: config.graph.base_url.clone(),
        }
    }

    fn base_url(&self, target: Target) -> &str {
        match target {
            Target::Workload => &self.workload_url,
            Target::LanguageModel => &self.llm_url,
            Target::Graph => &self.graph_url,
        }
    }
}

pub struct Gateway {
    settings: GatewaySettings,
    clients: DashMap<Target, Arc<OnceCell<Arc<ClientHandle>>>>,
    breakers: DashMap<Target, Arc<CircuitBreaker>>,
    constructions: DashMap<Target, usize>,
    workload: Arc<dyn WorkloadApi>,
    model: Option<Arc<dyn LanguageModel>>,
    llm_defaults: (u32, f32),
}

impl Gateway {
    /// Build the gateway. Fails with `Configuration` when TLS settings are unsafe for the profile.
    pub fn new(
        config: &CoreConfig,
        workload: Arc<dyn WorkloadApi>,
        model: Option<Arc<dyn LanguageModel>>,
    ) -> Result<Self> {
        config.validate_tls()?;
        Ok(Self {
            settings: GatewaySettings::from_config(config),
            clients: DashMap::new(),
            breakers: DashMap::new(),
            constructions: DashMap::new(),
            workload,
            model,
            llm_defaults: (config.llm.max_tokens, config.llm.temperature),
        })
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Returns the shared client for `target`, constructing it on first use.
    pub async fn get_client(&self, target: Target) -> Result<Arc<ClientHandle>> {
        // Clone the cell out so no map guard is held while the initializer runs.
        let cell = Arc::clone(self.clients.entry(target).or_default().value());
        let handle = cell
            .get_or_try_init(|| async { self.build_client(target) })
            .await?;
        Ok(Arc::clone(handle))
    }

    fn build_client(&self, target: Target) -> Result<Arc<ClientHandle>> {
        let http = reqwest::Client::builder()
            .timeout(self.settings.timeout)
            .pool_max_idle_per_host(self.settings.pool_max_idle_per_host)
            .danger_accept_invalid_certs(!self.settings.verify_tls)
            .build()
            .map_err(|e| {
                OpsError::Configuration(format!(
                    "failed to build {} client: {}",
                    target,
                    e.without_url()
                ))
            })?;
        *self.constructions.entry(target).or_insert(0) += 1;
        info!(
            target: "opsflow::gateway",
            upstream = %target,
            verify_tls = self.settings.verify_tls,
            "client constructed"
        );
        Ok(Arc::new(ClientHandle {
            target,
            http,
            base_url: self.settings.base_url(target).to_string(),
            created_at: Utc::now(),
        }))
    }

    /// Number of clients ever built for `target` (at most one per process).
    pub fn construction_count(&self, target: Target) -> usize {
        self.constructions.get(&target).map(|c| *c).unwrap_or(0)
    }

    fn breaker(&self, target: Target) -> Arc<CircuitBreaker> {
        let settings = &self.settings;
        Arc::clone(
            self.breakers
                .entry(target)
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(
                        settings.failure_threshold,
                        settings.cooldown,
                    ))
                })
                .value(),
        )
    }

    pub fn breaker_state(&self, target: Target) -> BreakerState {
        self.breaker(target).state()
    }

    /// Run `operation` against `target` under its circuit breaker.
    ///
    /// An open circuit returns `CircuitOpen` before the client is touched and before `f` runs.
    pub async fn call<T, F, Fut>(&self, target: Target, operation: &str, f: F) -> Result<T>
    where
        F: FnOnce(Arc<ClientHandle>) -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        let breaker = self.breaker(target);
        let permit = match breaker.try_acquire() {
            Some(p) => p,
            None => {
                debug!(target: "opsflow::gateway", upstream = %target, operation, "circuit open; failing fast");
                return Err(OpsError::CircuitOpen {
                    target: target.to_string(),
                });
            }
        };
        if permit.is_probe() {
            info!(target: "opsflow::gateway", upstream = %target, operation, "half-open probe");
        }
        let client = self.get_client(target).await?;

        match f(client).await {
            Ok(v) => {
                permit.success();
                Ok(v)
            }
            Err(UpstreamError::Transient(message)) => {
                permit.failure();
                warn!(
                    target: "opsflow::gateway",
                    upstream = %target,
                    operation,
                    breaker = ?breaker.state(),
                    "transient upstream failure"
                );
                debug!(target: "opsflow::gateway", upstream = %target, operation, detail = %message);
                Err(OpsError::TransientUpstream {
                    target: target.to_string(),
                    operation: operation.to_string(),
                    message,
                })
            }
            Err(UpstreamError::Rejected { status }) => {
                permit.success();
                warn!(target: "opsflow::gateway", upstream = %target, operation, status, "upstream rejected request");
                Err(OpsError::Upstream {
                    target: target.to_string(),
                    operation: operation.to_string(),
                    status,
                })
            }
        }
    }

    /// Execute a workload-automation operation.
    pub async fn workload(&self, op: WorkloadOp) -> Result<serde_json::Value> {
        let api = Arc::clone(&self.workload);
        let name = op.name();
        self.call(Target::Workload, name, move |client| async move {
            api.execute(&client, &op).await
        })
        .await
    }
}
