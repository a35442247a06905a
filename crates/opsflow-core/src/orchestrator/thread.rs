//! Thread state persisted in every checkpoint.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::{Entities, Intent, Message, Role, ToolCall, ToolOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    Answered,
    Failed,
    Cancelled,
    /// An upstream circuit was open; the user got a degraded-service reply.
    Degraded,
}

/// Position of a thread in the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Routing,
    AwaitingClarification { question: String },
    Handling,
    Invoking { call: ToolCall },
    Validating { call: ToolCall },
    AwaitingApproval { item_id: String, call: ToolCall },
    Synthesizing,
    Terminal { outcome: TerminalOutcome },
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Routing => "routing",
            Phase::AwaitingClarification { .. } => "awaiting_clarification",
            Phase::Handling => "handling",
            Phase::Invoking { .. } => "invoking",
            Phase::Validating { .. } => "validating",
            Phase::AwaitingApproval { .. } => "awaiting_approval",
            Phase::Synthesizing => "synthesizing",
            Phase::Terminal { .. } => "terminal",
        }
    }

    /// The thread is parked waiting for input from outside the engine.
    pub fn is_suspended(&self) -> bool {
        matches!(
            self,
            Phase::AwaitingClarification { .. }
                | Phase::AwaitingApproval { .. }
                | Phase::Terminal { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub messages: Vec<Message>,
    pub intent: Option<Intent>,
    pub entities: Entities,
    pub tool_outputs: Vec<ToolOutput>,
    pub error_count: u32,
    /// Failure reasons from earlier attempts of the current request.
    pub error_context: Vec<String>,
    pub terminal: bool,
    pub phase: Phase,
    pub correlation_id: String,
    #[serde(default)]
    pub pending_item: Option<String>,
    #[serde(default)]
    pub approved_item: Option<String>,
    #[serde(default)]
    pub last_response: Option<String>,
}

impl Thread {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            messages: Vec::new(),
            intent: None,
            entities: Entities::default(),
            tool_outputs: Vec::new(),
            error_count: 0,
            error_context: Vec::new(),
            terminal: false,
            phase: Phase::Routing,
            correlation_id: Uuid::new_v4().to_string(),
            pending_item: None,
            approved_item: None,
            last_response: None,
        }
    }

    /// Reset request-scoped fields for a new message in a finished thread. History stays.
    pub fn begin_cycle(&mut self) {
        self.intent = None;
        self.entities = Entities::default();
        self.tool_outputs.clear();
        self.error_count = 0;
        self.error_context.clear();
        self.terminal = false;
        self.phase = Phase::Routing;
        self.correlation_id = Uuid::new_v4().to_string();
        self.pending_item = None;
        self.approved_item = None;
    }

    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    pub fn output_for(&self, call_id: &str) -> Option<&ToolOutput> {
        self.tool_outputs.iter().find(|o| o.call_id == call_id)
    }

    /// Record the reply shown to the user.
    pub fn respond(&mut self, text: &str) {
        self.messages.push(Message::assistant(text));
        self.last_response = Some(text.to_string());
    }
}

/// What a caller of `submit_message` / `resume` gets back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Response {
        text: String,
        correlation_id: String,
    },
    PendingApproval {
        item_id: String,
        message: String,
    },
    ClarificationNeeded {
        question: String,
    },
}

impl SubmitOutcome {
    /// The text to show the user.
    pub fn text(&self) -> &str {
        match self {
            SubmitOutcome::Response { text, .. } => text,
            SubmitOutcome::PendingApproval { message, .. } => message,
            SubmitOutcome::ClarificationNeeded { question } => question,
        }
    }
}

/// Result of one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Suspended(SubmitOutcome),
}

/// Read-only view returned by `get_thread_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub phase: String,
    pub terminal_outcome: Option<TerminalOutcome>,
    pub intent: Option<Intent>,
    pub entities: Entities,
    pub error_count: u32,
    pub terminal: bool,
    pub pending_item: Option<String>,
    pub correlation_id: String,
    pub last_response: Option<String>,
    pub message_count: usize,
    pub tool_calls: usize,
    pub checkpoint_seq: u64,
}

impl ThreadSummary {
    pub fn from_thread(thread: &Thread, checkpoint_seq: u64) -> Self {
        Self {
            thread_id: thread.id.clone(),
            phase: thread.phase.label().to_string(),
            terminal_outcome: match &thread.phase {
                Phase::Terminal { outcome } => Some(*outcome),
                _ => None,
            },
            intent: thread.intent,
            entities: thread.entities.clone(),
            error_count: thread.error_count,
            terminal: thread.terminal,
            pending_item: thread.pending_item.clone(),
            correlation_id: thread.correlation_id.clone(),
            last_response: thread.last_response.clone(),
            message_count: thread.messages.len(),
            tool_calls: thread.tool_outputs.len(),
            checkpoint_seq,
        }
    }
}
