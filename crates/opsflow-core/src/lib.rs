//! opsflow-core: workload-automation agent core.
//!
//! Orchestration state machine with durable checkpoints, the audit/approval ledger, the graph
//! query service (TTL cache with request coalescing) and the resilient upstream gateway.
//! The daemon add-on wires these together; tests drive them directly.

mod checkpoint;
mod config;
mod error;
pub mod gateway;
pub mod graph;
mod ledger;
mod orchestrator;
mod security;
mod shared;

// Errors and configuration
pub use config::{
    BreakerConfig, CacheTtlConfig, CoreConfig, GraphConfig, LlmConfig, PoolConfig, Profile,
    RetryConfig, TlsConfig, WorkloadConfig,
};
pub use error::{OpsError, Result};

// Domain types shared by every layer
pub use shared::{
    now_ms, ActionType, Decision, Entities, Environment, Intent, Message, QueryKind, Role, Tool,
    ToolCall, ToolOutput,
};

// Durable state
pub use checkpoint::{Checkpoint, CheckpointMetadata, CheckpointStore};
pub use ledger::{
    semantic_key, AuditItem, AuditLedger, AuditStatus, DecisionOutcome, FlagOutcome, LedgerEvent,
};

// Upstream access
pub use gateway::{
    BreakerState, ClientHandle, Gateway, LanguageModel, Target, UpstreamError, WorkloadApi,
    WorkloadOp,
};
pub use graph::{GraphBackend, GraphQueryService, InMemoryGraph, QueryType};

// Orchestration
pub use orchestrator::{
    classify, extract_entities, missing_entity, ModelClassification, Orchestrator, Phase,
    StepOutcome, SubmitOutcome, TerminalOutcome, Thread, ThreadSummary, KNOWN_STATUSES,
};

// Redaction
pub use security::{PayloadRedactor, REDACTED_PLACEHOLDER};
