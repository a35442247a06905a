//! Error taxonomy shared by every component of the core.
//!
//! Variants carry enough detail for operators reading logs, but nothing that reaches a user
//! goes through `Display`: user-facing text comes from [`OpsError::user_message`], which never
//! includes connection strings, credentials or upstream bodies.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OpsError>;

/// Errors surfaced by the gateway, graph service, ledger, checkpoint store and orchestrator.
///
/// `Clone` because graph-query results (including failures) are broadcast to every waiter of a
/// coalesced fetch.
#[derive(Debug, Clone, Error)]
pub enum OpsError {
    /// Connect/timeout/5xx/429 from an upstream. Retried with backoff by the orchestrator.
    #[error("transient upstream failure on {target} ({operation}): {message}")]
    TransientUpstream {
        target: String,
        operation: String,
        message: String,
    },

    /// Upstream answered with a non-retryable status (4xx).
    #[error("upstream {target} rejected {operation} with status {status}")]
    Upstream {
        target: String,
        operation: String,
        status: u16,
    },

    #[error("circuit open for {target}")]
    CircuitOpen { target: String },

    #[error("validation failed: {0}")]
    Validation(String),

    /// Language-model output that could not be parsed (including truncation).
    #[error("malformed model output: {0}")]
    ModelOutput(String),

    #[error("audit item {id} already decided")]
    AuditConflict { id: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// Another worker advanced the thread first (lost the conditional checkpoint insert).
    #[error("thread {0} was advanced concurrently")]
    ThreadBusy(String),

    /// Fatal at startup; never recovered.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl OpsError {
    /// True for the kinds the retry loop handles with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OpsError::TransientUpstream { .. })
    }

    /// Text safe to show a user. Never contains upstream bodies, URLs or secrets.
    pub fn user_message(&self) -> String {
        match self {
            OpsError::TransientUpstream { .. } | OpsError::Upstream { .. } => {
                "The workload automation system did not complete the request.".to_string()
            }
            OpsError::CircuitOpen { target } => format!(
                "The {} service is temporarily unavailable. Please try again in a few minutes.",
                target
            ),
            OpsError::Validation(_) | OpsError::ModelOutput(_) => {
                "I could not produce a reliable answer for that request.".to_string()
            }
            OpsError::AuditConflict { .. } => {
                "That approval request has already been decided.".to_string()
            }
            OpsError::NotFound(_) => "The requested item was not found.".to_string(),
            OpsError::ThreadBusy(_) => {
                "This conversation is still processing a previous message.".to_string()
            }
            OpsError::Configuration(_) => {
                "The service is misconfigured. Please contact an administrator.".to_string()
            }
            OpsError::Storage(_) | OpsError::Serialization(_) => {
                "An internal error occurred.".to_string()
            }
        }
    }
}

impl From<sled::Error> for OpsError {
    fn from(e: sled::Error) -> Self {
        OpsError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for OpsError {
    fn from(e: serde_json::Error) -> Self {
        OpsError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for OpsError {
    fn from(e: tokio::task::JoinError) -> Self {
        OpsError::Storage(format!("blocking storage task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_never_echoes_upstream_detail() {
        let err = OpsError::TransientUpstream {
            target: "workload".into(),
            operation: "job_status".into(),
            message: "connect to postgres://admin:hunter2@db:5432 failed".into(),
        };
        let msg = err.user_message();
        assert!(!msg.contains("hunter2"));
        assert!(!msg.contains("postgres://"));
    }

    #[test]
    fn only_transient_upstream_is_retryable() {
        assert!(OpsError::TransientUpstream {
            target: "t".into(),
            operation: "o".into(),
            message: "m".into()
        }
        .is_retryable());
        assert!(!OpsError::CircuitOpen { target: "t".into() }.is_retryable());
        assert!(!OpsError::Validation("bad".into()).is_retryable());
    }
}
