//! Workload-automation API backend.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{ClientHandle, UpstreamError};
use crate::shared::ActionType;

/// Operations the core issues against the workload-automation system.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkloadOp {
    JobStatus { job: String },
    Dependencies { job: String },
    JobLog { job: String },
    Action {
        job: String,
        action: ActionType,
        /// Sent as `Idempotency-Key` so a replayed call is not executed twice upstream.
        idempotency_key: String,
    },
    ListWorkstations,
}

impl WorkloadOp {
    pub fn name(&self) -> &'static str {
        match self {
            WorkloadOp::JobStatus { .. } => "job_status",
            WorkloadOp::Dependencies { .. } => "list_dependencies",
            WorkloadOp::JobLog { .. } => "job_log",
            WorkloadOp::Action { .. } => "job_action",
            WorkloadOp::ListWorkstations => "list_workstations",
        }
    }
}

/// Backend seam for the workload API. Implementations receive the gateway's pooled client and
/// must report failures as [`UpstreamError`] without response bodies.
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    async fn execute(&self, client: &ClientHandle, op: &WorkloadOp) -> Result<Value, UpstreamError>;
}

/// REST implementation over HTTPS.
pub struct HttpWorkloadApi {
    api_token: Option<String>,
}

impl HttpWorkloadApi {
    pub fn new(api_token: Option<String>) -> Self {
        Self {
            api_token: api_token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

fn encode(segment: &str) -> String {
    segment
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect()
}

#[async_trait]
impl WorkloadApi for HttpWorkloadApi {
    async fn execute(&self, client: &ClientHandle, op: &WorkloadOp) -> Result<Value, UpstreamError> {
        let http = client.http();
        let req = match op {
            WorkloadOp::JobStatus { job } => {
                http.get(client.url(&format!("jobs/{}/status", encode(job))))
            }
            WorkloadOp::Dependencies { job } => {
                http.get(client.url(&format!("jobs/{}/dependencies", encode(job))))
            }
            WorkloadOp::JobLog { job } => http.get(client.url(&format!("jobs/{}/log", encode(job)))),
            WorkloadOp::Action {
                job,
                action,
                idempotency_key,
            } => http
                .post(client.url(&format!(
                    "jobs/{}/actions/{}",
                    encode(job),
                    action.as_str()
                )))
                .header("Idempotency-Key", idempotency_key.as_str()),
            WorkloadOp::ListWorkstations => http.get(client.url("workstations")),
        };

        let res = self
            .authorize(req)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        let status = res.status();
        if !status.is_success() {
            // Body stays out of errors and non-debug logs.
            let body = res.text().await.unwrap_or_default();
            debug!(target: "opsflow::gateway", operation = op.name(), status = status.as_u16(), body_len = body.len(), "workload error response");
            return Err(UpstreamError::from_status(status));
        }
        res.json::<Value>().await.map_err(UpstreamError::from_reqwest)
    }
}
