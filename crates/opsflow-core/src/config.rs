//! Core configuration loaded from file and environment.
//!
//! Precedence: env `OPSFLOW_CONFIG` path > `config/opsflow` > defaults, then environment
//! variables with prefix `OPSFLOW` and `__` as the section separator
//! (e.g. `OPSFLOW__TLS__VERIFY=false`, `OPSFLOW__WORKLOAD__API_TOKEN=...`).
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | profile | production | production \| staging \| development |
//! | storage_path | ./data | Root for the sled DB (checkpoints + audit ledger). |
//! | tls.verify | true | Certificate verification for every upstream. |
//! | tls.allow_insecure_dev | false | Explicit opt-out required to run with `verify = false` outside production. |
//! | retry.max_retries | 3 | Failed attempts before a thread terminates with an apology. |
//! | breaker.failure_threshold | 5 | Consecutive transient failures that open a circuit. |
//! | cache_ttl.* | 10s / 30s / 1h / 5min | Status / log / definition / dependency TTLs. |

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OpsError, Result};
use crate::shared::Environment;

const DEFAULT_CONFIG_PATH: &str = "config/opsflow";

fn default_true() -> bool {
    true
}

/// Deployment profile. Production is the default so an unconfigured process gets the strict rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Production,
    Staging,
    Development,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Must be set explicitly for a non-production profile to run with `verify = false`.
    #[serde(default)]
    pub allow_insecure_dev: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify: true,
            allow_insecure_dev: false,
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct WorkloadConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
}

impl fmt::Debug for WorkloadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Empty disables the model; the router and synthesizer then stay template-only.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_model() -> String {
    "meta-llama/llama-3.3-70b-instruct".to_string()
}

fn default_max_tokens() -> u32 {
    512
}

fn default_temperature() -> f32 {
    0.2
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_idle")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_idle() -> usize {
    8
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_max_idle(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given failure count (1-based), capped at `max_backoff_ms`.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// TTLs per volatility class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTtlConfig {
    #[serde(default = "default_status_secs")]
    pub status_secs: u64,
    #[serde(default = "default_log_secs")]
    pub log_secs: u64,
    #[serde(default = "default_definition_secs")]
    pub definition_secs: u64,
    #[serde(default = "default_dependency_secs")]
    pub dependency_secs: u64,
}

fn default_status_secs() -> u64 {
    10
}

fn default_log_secs() -> u64 {
    30
}

fn default_definition_secs() -> u64 {
    3_600
}

fn default_dependency_secs() -> u64 {
    300
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            status_secs: default_status_secs(),
            log_secs: default_log_secs(),
            definition_secs: default_definition_secs(),
            dependency_secs: default_dependency_secs(),
        }
    }
}

fn default_critical_threshold() -> usize {
    25
}

fn default_checkpoint_retention_secs() -> u64 {
    7 * 24 * 3_600
}

fn default_storage_path() -> String {
    "./data".to_string()
}

/// Top-level configuration for the core and the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub profile: Profile,
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache_ttl: CacheTtlConfig,
    /// Impact analysis marks a job critical when its transitive downstream set exceeds this.
    #[serde(default = "default_critical_threshold")]
    pub graph_critical_threshold: usize,
    #[serde(default = "default_checkpoint_retention_secs")]
    pub checkpoint_retention_secs: u64,
    /// Environment assumed for an ACTION when neither the message nor the workstation names one.
    #[serde(default)]
    pub default_environment: Environment,
    #[serde(default)]
    pub production_workstations: Vec<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            storage_path: default_storage_path(),
            tls: TlsConfig::default(),
            workload: WorkloadConfig::default(),
            llm: LlmConfig::default(),
            graph: GraphConfig::default(),
            breaker: BreakerConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            cache_ttl: CacheTtlConfig::default(),
            graph_critical_threshold: default_critical_threshold(),
            checkpoint_retention_secs: default_checkpoint_retention_secs(),
            default_environment: Environment::default(),
            production_workstations: Vec::new(),
        }
    }
}

impl CoreConfig {
    /// Load config from file and environment. Precedence: env `OPSFLOW_CONFIG` path >
    /// `config/opsflow` > defaults; `OPSFLOW__*` variables override both.
    pub fn load() -> std::result::Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("OPSFLOW_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = config::Config::builder()
            .set_default("profile", "production")?
            .set_default("storage_path", default_storage_path())?
            .set_default("tls.verify", true)?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder.add_source(config::File::with_name(&config_path).required(false))
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("OPSFLOW")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("production_workstations")
                    .try_parsing(true),
            )
            .build()?;

        built.try_deserialize()
    }

    /// TLS rules only. Called by the gateway before any client is built.
    pub fn validate_tls(&self) -> Result<()> {
        if self.tls.verify {
            return Ok(());
        }
        if self.profile == Profile::Production {
            return Err(OpsError::Configuration(
                "TLS verification cannot be disabled in the production profile".to_string(),
            ));
        }
        if !self.tls.allow_insecure_dev {
            return Err(OpsError::Configuration(
                "tls.verify = false requires tls.allow_insecure_dev = true".to_string(),
            ));
        }
        tracing::warn!(
            target: "opsflow::config",
            profile = ?self.profile,
            "TLS CERTIFICATE VERIFICATION IS DISABLED; upstream identities are not checked"
        );
        Ok(())
    }

    /// Startup validation. Any error here is fatal.
    pub fn validate(&self) -> Result<()> {
        self.validate_tls()?;
        if self.workload.base_url.trim().is_empty() {
            return Err(OpsError::Configuration(
                "workload.base_url is required".to_string(),
            ));
        }
        let has_token = self
            .workload
            .api_token
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false);
        if self.profile == Profile::Production && !has_token {
            return Err(OpsError::Configuration(
                "workload.api_token is required in the production profile".to_string(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(OpsError::Configuration(
                "retry.max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn production_workstation_set(&self) -> HashSet<String> {
        self.production_workstations
            .iter()
            .map(|w| w.trim().to_ascii_uppercase())
            .filter(|w| !w.is_empty())
            .collect()
    }

    pub fn checkpoint_retention(&self) -> Duration {
        Duration::from_secs(self.checkpoint_retention_secs)
    }
}
