//! Shared types used across the core: intents, entities, tool calls and messages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Request classification produced by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Status,
    Troubleshoot,
    Query,
    Action,
    General,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Status => "STATUS",
            Intent::Troubleshoot => "TROUBLESHOOT",
            Intent::Query => "QUERY",
            Intent::Action => "ACTION",
            Intent::General => "GENERAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STATUS" => Some(Intent::Status),
            "TROUBLESHOOT" => Some(Intent::Troubleshoot),
            "QUERY" => Some(Intent::Query),
            "ACTION" => Some(Intent::Action),
            "GENERAL" => Some(Intent::General),
            _ => None,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State-changing operations an ACTION request can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Rerun,
    Hold,
    Release,
    Cancel,
    Execute,
    Kill,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Rerun => "rerun",
            ActionType::Hold => "hold",
            ActionType::Release => "release",
            ActionType::Cancel => "cancel",
            ActionType::Execute => "execute",
            ActionType::Kill => "kill",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rerun" | "re-run" | "restart" => Some(ActionType::Rerun),
            "hold" => Some(ActionType::Hold),
            "release" => Some(ActionType::Release),
            "cancel" => Some(ActionType::Cancel),
            "execute" | "submit" | "run" => Some(ActionType::Execute),
            "kill" => Some(ActionType::Kill),
            _ => None,
        }
    }

    /// Capitalized label for responses ("Rerun", "Hold", ...).
    pub fn label(&self) -> &'static str {
        match self {
            ActionType::Rerun => "Rerun",
            ActionType::Hold => "Hold",
            ActionType::Release => "Release",
            ActionType::Cancel => "Cancel",
            ActionType::Execute => "Execution",
            ActionType::Kill => "Kill",
        }
    }
}

/// Which graph/catalog question a QUERY asks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Dependencies,
    Impact,
    CriticalJobs,
    CommonDependencies,
    Workstations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Test,
    Development,
}

/// Structured entities extracted from the conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    /// Additional jobs for multi-job queries (common dependencies).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workstation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Entities {
    /// Fill fields that are still missing from `other`. Existing values win.
    pub fn merge(&mut self, other: Entities) {
        if self.job.is_none() {
            self.job = other.job;
        }
        for j in other.jobs {
            if !self.jobs.contains(&j) {
                self.jobs.push(j);
            }
        }
        if self.workstation.is_none() {
            self.workstation = other.workstation;
        }
        if self.error_code.is_none() {
            self.error_code = other.error_code;
        }
        if self.action.is_none() {
            self.action = other.action;
        }
        if self.environment.is_none() {
            self.environment = other.environment;
        }
        if self.query.is_none() {
            self.query = other.query;
        }
        if self.limit.is_none() {
            self.limit = other.limit;
        }
    }

    /// The job plus any extra jobs, deduplicated in mention order.
    pub fn all_jobs(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for j in self.job.iter().chain(self.jobs.iter()) {
            if !out.contains(j) {
                out.push(j.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp_ms: i64,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp_ms: now_ms(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp_ms: now_ms(),
        }
    }
}

/// A tool the orchestrator can invoke. Every variant is served by the gateway or the graph service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum Tool {
    JobStatus { job: String },
    /// Status, recent log and upstream chain in one call.
    Troubleshoot { job: String },
    DependencyChain { job: String },
    Impact { job: String },
    CriticalJobs { limit: usize },
    CommonDependencies { jobs: Vec<String> },
    Workstations { job: Option<String> },
    JobAction { job: String, action: ActionType },
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::JobStatus { .. } => "job_status",
            Tool::Troubleshoot { .. } => "troubleshoot",
            Tool::DependencyChain { .. } => "dependency_chain",
            Tool::Impact { .. } => "impact_analysis",
            Tool::CriticalJobs { .. } => "critical_jobs",
            Tool::CommonDependencies { .. } => "common_dependencies",
            Tool::Workstations { .. } => "workstations",
            Tool::JobAction { .. } => "job_action",
        }
    }

    /// True when the call changes state in the workload system.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Tool::JobAction { .. })
    }
}

/// A planned tool invocation. The id doubles as the upstream idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool: Tool,
}

impl ToolCall {
    /// Read-only calls get a fresh id per attempt so a retry fetches again. Mutating calls keep
    /// one id for the whole cycle: every retry of an action replays the same idempotency key.
    pub fn new(correlation_id: &str, attempt: u32, tool: Tool) -> Self {
        let id = if tool.is_mutating() {
            format!("{}-{}", correlation_id, tool.name())
        } else {
            format!("{}-{}-{}", correlation_id, attempt, tool.name())
        };
        Self { id, tool }
    }
}

/// A completed tool call as recorded in the thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub call_id: String,
    pub tool: Tool,
    pub result: serde_json::Value,
    pub completed_ms: i64,
}

/// Reviewer decision on an audit item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject { reason: String },
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
