//! Orchestration state machine.
//!
//! A request moves Routing → Handling → Invoking → Validating → (AwaitingApproval) →
//! Synthesizing → Terminal. Every transition is committed as a new checkpoint before the next
//! one starts, so the latest checkpoint is always the exact resumption point:
//!
//! - a tool output is recorded in the same checkpoint that moves the thread to Validating, and
//!   a recorded call is never issued again;
//! - a validation or transient failure increments `error_count`, appends the reason to the
//!   error context and returns to Handling after an exponential backoff that an operator can
//!   abort; the thread fails once `error_count` reaches `retry.max_retries`;
//! - state-changing actions against production flag an item in the [`AuditLedger`] and park
//!   the thread until a decision arrives, either through [`Orchestrator::decide_audit_item`]
//!   or a ledger event picked up by [`Orchestrator::run_ledger_listener`].
//!
//! Within one process a thread has at most one driver; across processes the conditional
//! checkpoint insert rejects the slower writer with `ThreadBusy`.

mod router;
mod synthesize;
mod thread;
mod validate;

pub use router::{classify, extract_entities, missing_entity, ModelClassification};
pub use thread::{Phase, StepOutcome, SubmitOutcome, TerminalOutcome, Thread, ThreadSummary};
pub use validate::KNOWN_STATUSES;

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointMetadata, CheckpointStore};
use crate::config::CoreConfig;
use crate::error::{OpsError, Result};
use crate::gateway::{Gateway, WorkloadOp};
use crate::graph::{GraphQueryService, QueryType};
use crate::ledger::{AuditLedger, DecisionOutcome, LedgerEvent};
use crate::security::PayloadRedactor;
use crate::shared::{
    now_ms, ActionType, Decision, Entities, Environment, Intent, Message, QueryKind, Tool,
    ToolCall, ToolOutput,
};

const DEFAULT_CRITICAL_LIMIT: usize = 10;
const CANCEL_REVIEWER: &str = "operator-cancel";

/// A loaded thread and the checkpoint it was read from.
struct Cursor {
    thread: Thread,
    parent: Option<(u64, String)>,
}

impl Cursor {
    fn seq(&self) -> u64 {
        self.parent.as_ref().map(|(seq, _)| *seq).unwrap_or(0)
    }
}

/// Registration of the in-process driver of one thread. Dropping it frees the slot.
struct DriverGuard<'a> {
    drivers: &'a DashMap<String, watch::Sender<bool>>,
    thread_id: String,
    abort: watch::Receiver<bool>,
}

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        self.drivers.remove(&self.thread_id);
    }
}

/// Resolves when an operator abort has been signalled. Never resolves otherwise.
async fn abort_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let flagged = *rx.borrow_and_update();
        if flagged {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn abort_flagged(rx: &watch::Receiver<bool>) -> bool {
    let flagged = *rx.borrow();
    flagged
}

fn required_job(entities: &Entities) -> Result<String> {
    entities
        .job
        .clone()
        .ok_or_else(|| OpsError::Validation("job name missing".to_string()))
}

pub struct Orchestrator {
    config: CoreConfig,
    gateway: Arc<Gateway>,
    graph: Arc<GraphQueryService>,
    ledger: AuditLedger,
    checkpoints: CheckpointStore,
    redactor: PayloadRedactor,
    production_workstations: HashSet<String>,
    drivers: DashMap<String, watch::Sender<bool>>,
    /// Items being decided through `decide_audit_item`; the ledger listener skips them.
    self_decided: DashSet<String>,
}

impl Orchestrator {
    pub fn new(
        config: CoreConfig,
        db: &sled::Db,
        gateway: Arc<Gateway>,
        graph: Arc<GraphQueryService>,
    ) -> Result<Self> {
        let ledger = AuditLedger::open(db)?;
        let checkpoints = CheckpointStore::open(db, config.checkpoint_retention())?;
        let production_workstations = config.production_workstation_set();
        Ok(Self {
            config,
            gateway,
            graph,
            ledger,
            checkpoints,
            redactor: PayloadRedactor::default(),
            production_workstations,
            drivers: DashMap::new(),
            self_decided: DashSet::new(),
        })
    }

    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    pub fn graph(&self) -> &Arc<GraphQueryService> {
        &self.graph
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    // ---------------------------------------------------------------------------
    // Public operations
    // ---------------------------------------------------------------------------

    /// Accept a user message and drive the thread to its next suspend point.
    pub async fn submit_message(&self, thread_id: &str, text: &str) -> Result<SubmitOutcome> {
        let mut driver = self.claim(thread_id)?;
        let mut cursor = match self.accept_message(thread_id, text).await? {
            Ok(cursor) => cursor,
            Err(parked) => return Ok(parked),
        };
        self.drive(&mut cursor, &mut driver.abort).await
    }

    /// Record a user message without driving the thread. `step` or `resume` continue from it.
    pub async fn post_message(&self, thread_id: &str, text: &str) -> Result<ThreadSummary> {
        let _driver = self.claim(thread_id)?;
        match self.accept_message(thread_id, text).await? {
            Ok(cursor) => Ok(ThreadSummary::from_thread(&cursor.thread, cursor.seq())),
            Err(_) => self.get_thread_status(thread_id).await,
        }
    }

    pub async fn get_thread_status(&self, thread_id: &str) -> Result<ThreadSummary> {
        let cursor = self
            .load(thread_id)
            .await?
            .ok_or_else(|| OpsError::NotFound(format!("thread {}", thread_id)))?;
        Ok(ThreadSummary::from_thread(&cursor.thread, cursor.seq()))
    }

    /// Drive a thread from its latest checkpoint to the next suspend point.
    pub async fn resume(&self, thread_id: &str) -> Result<SubmitOutcome> {
        let mut driver = self.claim(thread_id)?;
        let mut cursor = self.load_existing(thread_id).await?;
        self.drive(&mut cursor, &mut driver.abort).await
    }

    /// Perform exactly one transition from the latest checkpoint.
    pub async fn step(&self, thread_id: &str) -> Result<StepOutcome> {
        let mut driver = self.claim(thread_id)?;
        let mut cursor = self.load_existing(thread_id).await?;
        self.transition(&mut cursor, &mut driver.abort).await
    }

    /// Apply a reviewer decision, then resume the thread waiting on it.
    pub async fn decide_audit_item(
        &self,
        item_id: &str,
        decision: Decision,
        reviewer: &str,
    ) -> Result<SubmitOutcome> {
        let item = self
            .ledger
            .get(item_id)
            .await?
            .ok_or_else(|| OpsError::NotFound(format!("audit item {}", item_id)))?;

        self.self_decided.insert(item_id.to_string());
        let decided = match &decision {
            Decision::Approve => self.ledger.approve(item_id, reviewer).await,
            Decision::Reject { reason } => self.ledger.reject(item_id, reviewer, reason).await,
        };
        let result = match decided {
            Ok(DecisionOutcome::Applied) => {
                info!(
                    target: "opsflow::orchestrator",
                    item_id,
                    thread_id = %item.thread_id,
                    reviewer,
                    decision = ?decision,
                    "audit decision applied; resuming thread"
                );
                self.resume(&item.thread_id).await
            }
            Ok(DecisionOutcome::AlreadyDecided) => Err(OpsError::AuditConflict {
                id: item_id.to_string(),
            }),
            Ok(DecisionOutcome::NotFound) => {
                Err(OpsError::NotFound(format!("audit item {}", item_id)))
            }
            Err(e) => Err(e),
        };
        self.self_decided.remove(item_id);
        result
    }

    /// Cancel a thread. A parked thread goes straight to Terminal (rejecting its pending audit
    /// item); a thread with an active driver is signalled and stops at its backoff or next
    /// transition.
    pub async fn cancel_thread(&self, thread_id: &str) -> Result<SubmitOutcome> {
        let signalled = self
            .drivers
            .get(thread_id)
            .map(|tx| {
                tx.send_replace(true);
            })
            .is_some();
        if signalled {
            info!(target: "opsflow::orchestrator", thread_id, "abort signalled to active driver");
            let correlation_id = self
                .load(thread_id)
                .await?
                .map(|c| c.thread.correlation_id)
                .unwrap_or_default();
            return Ok(SubmitOutcome::Response {
                text: "Cancellation requested. The request will stop before its next step."
                    .to_string(),
                correlation_id,
            });
        }

        let _driver = self.claim(thread_id)?;
        let mut cursor = self.load_existing(thread_id).await?;
        if let Phase::Terminal { .. } = cursor.thread.phase {
            return Ok(SubmitOutcome::Response {
                text: cursor.thread.last_response.clone().unwrap_or_default(),
                correlation_id: cursor.thread.correlation_id.clone(),
            });
        }
        self.cancel_in_place(&mut cursor, "cancelled by operator").await
    }

    /// Resume the thread waiting on a decision made outside this engine.
    pub async fn handle_ledger_event(&self, event: &LedgerEvent) -> Result<Option<SubmitOutcome>> {
        if self.self_decided.contains(&event.item_id) {
            return Ok(None);
        }
        let waiting = match self.load(&event.thread_id).await? {
            Some(cursor) => matches!(
                &cursor.thread.phase,
                Phase::AwaitingApproval { item_id, .. } if *item_id == event.item_id
            ),
            None => false,
        };
        if !waiting {
            debug!(target: "opsflow::orchestrator", item_id = %event.item_id, "ledger event for no waiting thread");
            return Ok(None);
        }
        self.resume(&event.thread_id).await.map(Some)
    }

    /// Consume ledger events until the ledger is dropped.
    pub async fn run_ledger_listener(self: Arc<Self>) {
        let mut events = self.ledger.subscribe();
        loop {
            match events.recv().await {
                Ok(event) => match self.handle_ledger_event(&event).await {
                    Ok(Some(_)) => {
                        debug!(target: "opsflow::orchestrator", thread_id = %event.thread_id, "thread resumed from ledger event")
                    }
                    Ok(None) => {}
                    Err(OpsError::ThreadBusy(_)) => {
                        debug!(target: "opsflow::orchestrator", thread_id = %event.thread_id, "thread already being driven")
                    }
                    Err(e) => {
                        warn!(target: "opsflow::orchestrator", thread_id = %event.thread_id, error = %e, "resume from ledger event failed")
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "opsflow::orchestrator", skipped, "ledger listener lagged; some decisions need a manual resume")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub async fn collect_expired_checkpoints(&self) -> Result<usize> {
        self.checkpoints.collect_expired(now_ms()).await
    }

    /// State-changing ACTION against a production target.
    pub fn requires_approval(&self, intent: Intent, entities: &Entities) -> bool {
        intent == Intent::Action
            && entities.action.is_some()
            && self.target_environment(entities) == Environment::Production
    }

    fn target_environment(&self, entities: &Entities) -> Environment {
        if let Some(env) = entities.environment {
            return env;
        }
        let on_production_workstation = entities
            .workstation
            .as_deref()
            .map(|w| self.production_workstations.contains(&w.to_ascii_uppercase()))
            .unwrap_or(false);
        if on_production_workstation {
            Environment::Production
        } else {
            self.config.default_environment
        }
    }

    // ---------------------------------------------------------------------------
    // Cursor plumbing
    // ---------------------------------------------------------------------------

    fn claim(&self, thread_id: &str) -> Result<DriverGuard<'_>> {
        let abort = match self.drivers.entry(thread_id.to_string()) {
            Entry::Occupied(_) => return Err(OpsError::ThreadBusy(thread_id.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(false);
                slot.insert(tx);
                rx
            }
        };
        Ok(DriverGuard {
            drivers: &self.drivers,
            thread_id: thread_id.to_string(),
            abort,
        })
    }

    async fn load(&self, thread_id: &str) -> Result<Option<Cursor>> {
        match self.checkpoints.latest(thread_id).await? {
            Some(cp) => Ok(Some(Cursor {
                thread: serde_json::from_value(cp.state)?,
                parent: Some((cp.seq, cp.checkpoint_id)),
            })),
            None => Ok(None),
        }
    }

    async fn load_existing(&self, thread_id: &str) -> Result<Cursor> {
        self.load(thread_id)
            .await?
            .ok_or_else(|| OpsError::NotFound(format!("thread {}", thread_id)))
    }

    async fn commit(&self, cursor: &mut Cursor, transition: &str) -> Result<()> {
        let metadata = CheckpointMetadata {
            phase: cursor.thread.phase.label().to_string(),
            transition: transition.to_string(),
            terminal: cursor.thread.terminal,
        };
        let state = serde_json::to_value(&cursor.thread)?;
        let cp = self
            .checkpoints
            .append(&cursor.thread.id, cursor.parent.clone(), state, metadata)
            .await?;
        cursor.parent = Some((cp.seq, cp.checkpoint_id));
        Ok(())
    }

    /// Apply a new message to the thread and commit it. `Err(outcome)` when the thread is
    /// parked on approval and the message is not taken.
    async fn accept_message(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Result<std::result::Result<Cursor, SubmitOutcome>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(OpsError::Validation("empty message".to_string()));
        }
        let mut cursor = match self.load(thread_id).await? {
            Some(cursor) => cursor,
            None => Cursor {
                thread: Thread::new(thread_id),
                parent: None,
            },
        };
        match &cursor.thread.phase {
            Phase::AwaitingApproval { item_id, .. } => {
                return Ok(Err(SubmitOutcome::PendingApproval {
                    item_id: item_id.clone(),
                    message: cursor
                        .thread
                        .last_response
                        .clone()
                        .unwrap_or_else(|| "This request is awaiting approval.".to_string()),
                }));
            }
            Phase::Terminal { .. } => cursor.thread.begin_cycle(),
            Phase::AwaitingClarification { .. } => cursor.thread.phase = Phase::Routing,
            Phase::Routing if cursor.parent.is_none() => {}
            _ => return Err(OpsError::ThreadBusy(thread_id.to_string())),
        }
        cursor.thread.messages.push(Message::user(text));
        info!(
            target: "opsflow::orchestrator",
            thread_id,
            correlation_id = %cursor.thread.correlation_id,
            "message accepted"
        );
        self.commit(&mut cursor, "message_received").await?;
        Ok(Ok(cursor))
    }

    async fn drive(
        &self,
        cursor: &mut Cursor,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<SubmitOutcome> {
        loop {
            if abort_flagged(abort) && !cursor.thread.phase.is_suspended() {
                return self.cancel_in_place(cursor, "cancelled by operator").await;
            }
            match self.transition(cursor, abort).await? {
                StepOutcome::Continue => {}
                StepOutcome::Suspended(outcome) => return Ok(outcome),
            }
        }
    }

    async fn transition(
        &self,
        cursor: &mut Cursor,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<StepOutcome> {
        match cursor.thread.phase.clone() {
            Phase::Routing => self.route_step(cursor).await,
            Phase::AwaitingClarification { question } => {
                Ok(StepOutcome::Suspended(SubmitOutcome::ClarificationNeeded { question }))
            }
            Phase::Handling => self.handle_step(cursor).await,
            Phase::Invoking { call } => self.invoke_step(cursor, call, abort).await,
            Phase::Validating { call } => self.validate_step(cursor, call, abort).await,
            Phase::AwaitingApproval { item_id, call } => {
                self.approval_step(cursor, item_id, call).await
            }
            Phase::Synthesizing => self.synthesize_step(cursor).await,
            Phase::Terminal { .. } => Ok(StepOutcome::Suspended(SubmitOutcome::Response {
                text: cursor.thread.last_response.clone().unwrap_or_default(),
                correlation_id: cursor.thread.correlation_id.clone(),
            })),
        }
    }

    // ---------------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------------

    async fn route_step(&self, cursor: &mut Cursor) -> Result<StepOutcome> {
        let text = cursor
            .thread
            .last_user_message()
            .unwrap_or_default()
            .to_string();
        let (intent, entities) = match cursor.thread.intent {
            // Reply to a clarification question: keep the intent, fill in entities.
            Some(intent) => {
                let mut entities = cursor.thread.entities.clone();
                let found = router::clarification_entities(intent, &entities, &text);
                entities.merge(found);
                (intent, entities)
            }
            None => match router::classify(&text) {
                Some(classified) => classified,
                None => self.classify_with_model(&text).await,
            },
        };
        debug!(
            target: "opsflow::orchestrator",
            thread_id = %cursor.thread.id,
            intent = %intent,
            job = ?entities.job,
            "request routed"
        );
        cursor.thread.intent = Some(intent);
        cursor.thread.entities = entities;

        if let Some(question) = router::missing_entity(intent, &cursor.thread.entities) {
            cursor.thread.phase = Phase::AwaitingClarification {
                question: question.clone(),
            };
            cursor.thread.respond(&question);
            self.commit(cursor, "clarification_requested").await?;
            return Ok(StepOutcome::Suspended(SubmitOutcome::ClarificationNeeded {
                question,
            }));
        }
        cursor.thread.phase = Phase::Handling;
        self.commit(cursor, "routed").await?;
        Ok(StepOutcome::Continue)
    }

    async fn classify_with_model(&self, text: &str) -> (Intent, Entities) {
        if !self.gateway.has_model() {
            return (Intent::General, router::extract_entities(text));
        }
        let request = self
            .gateway
            .completion_request(router::CLASSIFIER_SYSTEM_PROMPT, &self.redactor.mask_text(text));
        match self
            .gateway
            .structured_completion::<ModelClassification>(request)
            .await
        {
            Ok(classification) => classification.into_parts(text),
            Err(e) => {
                warn!(target: "opsflow::orchestrator", error = %e, "model classification failed; treating request as GENERAL");
                (Intent::General, router::extract_entities(text))
            }
        }
    }

    async fn handle_step(&self, cursor: &mut Cursor) -> Result<StepOutcome> {
        let intent = cursor.thread.intent.unwrap_or(Intent::General);
        let entities = &cursor.thread.entities;
        if !cursor.thread.error_context.is_empty() {
            debug!(
                target: "opsflow::orchestrator",
                thread_id = %cursor.thread.id,
                attempt = cursor.thread.error_count + 1,
                previous = ?cursor.thread.error_context,
                "retrying with error context"
            );
        }
        let tool = match intent {
            Intent::General => {
                cursor.thread.phase = Phase::Synthesizing;
                self.commit(cursor, "handled").await?;
                return Ok(StepOutcome::Continue);
            }
            Intent::Status => Tool::JobStatus {
                job: required_job(entities)?,
            },
            Intent::Troubleshoot => Tool::Troubleshoot {
                job: required_job(entities)?,
            },
            // Status precheck; the action itself is planned after validation.
            Intent::Action => Tool::JobStatus {
                job: required_job(entities)?,
            },
            Intent::Query => match entities.query.unwrap_or(QueryKind::Dependencies) {
                QueryKind::Dependencies => Tool::DependencyChain {
                    job: required_job(entities)?,
                },
                QueryKind::Impact => Tool::Impact {
                    job: required_job(entities)?,
                },
                QueryKind::CriticalJobs => Tool::CriticalJobs {
                    limit: entities.limit.unwrap_or(DEFAULT_CRITICAL_LIMIT),
                },
                QueryKind::CommonDependencies => Tool::CommonDependencies {
                    jobs: entities.all_jobs(),
                },
                QueryKind::Workstations => Tool::Workstations {
                    job: entities.job.clone(),
                },
            },
        };
        let call = ToolCall::new(&cursor.thread.correlation_id, cursor.thread.error_count, tool);
        cursor.thread.phase = Phase::Invoking { call };
        self.commit(cursor, "tool_planned").await?;
        Ok(StepOutcome::Continue)
    }

    async fn invoke_step(
        &self,
        cursor: &mut Cursor,
        call: ToolCall,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<StepOutcome> {
        if cursor.thread.output_for(&call.id).is_some() {
            debug!(target: "opsflow::orchestrator", call_id = %call.id, "tool call already recorded; not re-invoking");
            cursor.thread.phase = Phase::Validating { call };
            self.commit(cursor, "tool_replayed").await?;
            return Ok(StepOutcome::Continue);
        }

        info!(
            target: "opsflow::orchestrator",
            thread_id = %cursor.thread.id,
            correlation_id = %cursor.thread.correlation_id,
            call_id = %call.id,
            tool = call.tool.name(),
            "invoking tool"
        );
        match self.invoke_tool(&call).await {
            Ok(result) => {
                cursor.thread.tool_outputs.push(ToolOutput {
                    call_id: call.id.clone(),
                    tool: call.tool.clone(),
                    result,
                    completed_ms: now_ms(),
                });
                cursor.thread.phase = Phase::Validating { call };
                self.commit(cursor, "tool_completed").await?;
                Ok(StepOutcome::Continue)
            }
            Err(e) => self.fail_attempt(cursor, e, abort).await,
        }
    }

    async fn validate_step(
        &self,
        cursor: &mut Cursor,
        call: ToolCall,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<StepOutcome> {
        let result = match cursor.thread.output_for(&call.id) {
            Some(output) => output.result.clone(),
            None => {
                cursor.thread.phase = Phase::Invoking { call };
                self.commit(cursor, "output_missing").await?;
                return Ok(StepOutcome::Continue);
            }
        };

        if let Err(reason) = validate::check(&call.tool, &result) {
            // The cached answer was unusable; make the next attempt fetch again.
            if let Tool::JobStatus { job } | Tool::Troubleshoot { job } = &call.tool {
                self.graph.invalidate_key(QueryType::JobStatus, &[job]);
                self.graph.invalidate_key(QueryType::JobLog, &[job]);
            }
            return self
                .fail_attempt(cursor, OpsError::Validation(reason), abort)
                .await;
        }

        let intent = cursor.thread.intent.unwrap_or(Intent::General);
        if intent == Intent::Action && matches!(call.tool, Tool::JobStatus { .. }) {
            return self.plan_action(cursor).await;
        }

        cursor.thread.phase = Phase::Synthesizing;
        self.commit(cursor, "validated").await?;
        Ok(StepOutcome::Continue)
    }

    /// After a good status precheck: park for approval or go straight to the action call.
    async fn plan_action(&self, cursor: &mut Cursor) -> Result<StepOutcome> {
        let entities = cursor.thread.entities.clone();
        let job = required_job(&entities)?;
        let action: ActionType = entities
            .action
            .ok_or_else(|| OpsError::Validation("action type missing".to_string()))?;
        let call = ToolCall::new(
            &cursor.thread.correlation_id,
            cursor.thread.error_count,
            Tool::JobAction {
                job: job.clone(),
                action,
            },
        );

        if self.requires_approval(Intent::Action, &entities) && cursor.thread.approved_item.is_none() {
            let payload = json!({
                "job": job,
                "action": action,
                "environment": self.target_environment(&entities),
                "workstation": entities.workstation,
            });
            let flagged = self.ledger.flag(&cursor.thread.id, payload).await?;
            let item_id = flagged.id().to_string();
            let message = synthesize::approval_message(action.label(), &job, &item_id);
            cursor.thread.pending_item = Some(item_id.clone());
            cursor.thread.phase = Phase::AwaitingApproval {
                item_id: item_id.clone(),
                call,
            };
            cursor.thread.respond(&message);
            self.commit(cursor, "approval_requested").await?;
            info!(
                target: "opsflow::orchestrator",
                thread_id = %cursor.thread.id,
                item_id = %item_id,
                "thread suspended pending approval"
            );
            return Ok(StepOutcome::Suspended(SubmitOutcome::PendingApproval {
                item_id,
                message,
            }));
        }

        cursor.thread.phase = Phase::Invoking { call };
        self.commit(cursor, "action_planned").await?;
        Ok(StepOutcome::Continue)
    }

    async fn approval_step(
        &self,
        cursor: &mut Cursor,
        item_id: String,
        call: ToolCall,
    ) -> Result<StepOutcome> {
        // Decisions only move items out of pending, so a non-pending answer is final.
        if self.ledger.is_pending(&item_id).await? {
            let message = cursor
                .thread
                .last_response
                .clone()
                .unwrap_or_else(|| "This request is awaiting approval.".to_string());
            return Ok(StepOutcome::Suspended(SubmitOutcome::PendingApproval {
                item_id,
                message,
            }));
        }
        if self.ledger.is_approved(&item_id).await? {
            info!(target: "opsflow::orchestrator", thread_id = %cursor.thread.id, item_id = %item_id, "approval granted");
            cursor.thread.approved_item = Some(item_id);
            cursor.thread.pending_item = None;
            cursor.thread.phase = Phase::Invoking { call };
            self.commit(cursor, "approved").await?;
            return Ok(StepOutcome::Continue);
        }

        let reason = self
            .ledger
            .get(&item_id)
            .await?
            .and_then(|item| item.reason)
            .unwrap_or_else(|| "no reason given".to_string());
        cursor.thread.pending_item = None;
        let text = synthesize::cancelled_message(&format!(
            "the approval request was rejected ({})",
            self.redactor.mask_text(&reason)
        ));
        let outcome = self
            .finish(cursor, TerminalOutcome::Cancelled, text, "rejected")
            .await?;
        Ok(StepOutcome::Suspended(outcome))
    }

    async fn synthesize_step(&self, cursor: &mut Cursor) -> Result<StepOutcome> {
        let text = match synthesize::render(&cursor.thread, &self.redactor) {
            Some(text) => text,
            None => self.model_answer(&cursor.thread).await,
        };
        let outcome = self
            .finish(cursor, TerminalOutcome::Answered, text, "responded")
            .await?;
        Ok(StepOutcome::Suspended(outcome))
    }

    async fn model_answer(&self, thread: &Thread) -> String {
        if !self.gateway.has_model() {
            return synthesize::generic_reply();
        }
        let context = synthesize::model_context(thread, &self.redactor);
        let request = self
            .gateway
            .completion_request(synthesize::GENERAL_SYSTEM_PROMPT, &context);
        match self.gateway.complete_text(request).await {
            Ok(text) => self.redactor.mask_text(text.trim()),
            Err(e) => {
                warn!(target: "opsflow::orchestrator", thread_id = %thread.id, error = %e, "model answer unavailable; using template");
                synthesize::generic_reply()
            }
        }
    }

    /// Failure of one attempt: degrade, fail, or schedule a retry with backoff.
    async fn fail_attempt(
        &self,
        cursor: &mut Cursor,
        err: OpsError,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<StepOutcome> {
        let correlation_id = cursor.thread.correlation_id.clone();
        let retryable = match &err {
            OpsError::CircuitOpen { .. } => {
                warn!(target: "opsflow::orchestrator", thread_id = %cursor.thread.id, %correlation_id, error = %err, "circuit open; degrading");
                let text = format!("{} Reference: {}.", err.user_message(), correlation_id);
                let outcome = self
                    .finish(cursor, TerminalOutcome::Degraded, text, "circuit_open")
                    .await?;
                return Ok(StepOutcome::Suspended(outcome));
            }
            OpsError::ThreadBusy(_) | OpsError::Storage(_) | OpsError::Serialization(_) => {
                return Err(err)
            }
            e => e.is_retryable() || matches!(e, OpsError::Validation(_) | OpsError::ModelOutput(_)),
        };
        if !retryable {
            warn!(target: "opsflow::orchestrator", thread_id = %cursor.thread.id, %correlation_id, error = %err, "non-retryable failure");
            let text = format!("{} Reference: {}.", err.user_message(), correlation_id);
            let outcome = self
                .finish(cursor, TerminalOutcome::Failed, text, "failed")
                .await?;
            return Ok(StepOutcome::Suspended(outcome));
        }

        cursor.thread.error_count += 1;
        cursor
            .thread
            .error_context
            .push(self.redactor.mask_text(&err.to_string()));
        let attempts = cursor.thread.error_count;
        warn!(
            target: "opsflow::orchestrator",
            thread_id = %cursor.thread.id,
            %correlation_id,
            attempt = attempts,
            error = %err,
            "attempt failed"
        );
        if attempts >= self.config.retry.max_retries {
            let text = synthesize::apology(attempts, &correlation_id);
            let outcome = self
                .finish(cursor, TerminalOutcome::Failed, text, "retries_exhausted")
                .await?;
            return Ok(StepOutcome::Suspended(outcome));
        }

        cursor.thread.phase = Phase::Handling;
        self.commit(cursor, "retry_scheduled").await?;
        let delay = self.config.retry.backoff_for(attempts);
        debug!(target: "opsflow::orchestrator", thread_id = %cursor.thread.id, delay_ms = delay.as_millis() as u64, "backing off");
        let aborted = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = abort_requested(abort) => true,
        };
        if aborted {
            let outcome = self
                .cancel_in_place(cursor, "cancelled by operator during retry backoff")
                .await?;
            return Ok(StepOutcome::Suspended(outcome));
        }
        Ok(StepOutcome::Continue)
    }

    async fn cancel_in_place(&self, cursor: &mut Cursor, reason: &str) -> Result<SubmitOutcome> {
        if let Phase::AwaitingApproval { item_id, .. } = &cursor.thread.phase {
            let outcome = self.ledger.reject(item_id, CANCEL_REVIEWER, reason).await?;
            debug!(target: "opsflow::orchestrator", item_id = %item_id, outcome = ?outcome, "pending audit item closed by cancel");
            cursor.thread.pending_item = None;
        }
        info!(target: "opsflow::orchestrator", thread_id = %cursor.thread.id, reason, "thread cancelled");
        self.finish(
            cursor,
            TerminalOutcome::Cancelled,
            synthesize::cancelled_message(reason),
            "cancelled",
        )
        .await
    }

    async fn finish(
        &self,
        cursor: &mut Cursor,
        outcome: TerminalOutcome,
        text: String,
        transition: &str,
    ) -> Result<SubmitOutcome> {
        cursor.thread.phase = Phase::Terminal { outcome };
        cursor.thread.terminal = true;
        cursor.thread.respond(&text);
        self.commit(cursor, transition).await?;
        info!(
            target: "opsflow::orchestrator",
            thread_id = %cursor.thread.id,
            correlation_id = %cursor.thread.correlation_id,
            outcome = ?outcome,
            "thread reached terminal state"
        );
        Ok(SubmitOutcome::Response {
            text,
            correlation_id: cursor.thread.correlation_id.clone(),
        })
    }

    // ---------------------------------------------------------------------------
    // Tools
    // ---------------------------------------------------------------------------

    async fn job_status(&self, job: &str) -> Result<Value> {
        let gateway = Arc::clone(&self.gateway);
        let owned = job.to_string();
        let value = self
            .graph
            .cached(QueryType::JobStatus, &[job], move || async move {
                gateway.workload(WorkloadOp::JobStatus { job: owned }).await
            })
            .await?;
        Ok(value.as_ref().clone())
    }

    async fn job_log(&self, job: &str) -> Result<Value> {
        let gateway = Arc::clone(&self.gateway);
        let owned = job.to_string();
        let value = self
            .graph
            .cached(QueryType::JobLog, &[job], move || async move {
                gateway.workload(WorkloadOp::JobLog { job: owned }).await
            })
            .await?;
        Ok(value.as_ref().clone())
    }

    async fn invoke_tool(&self, call: &ToolCall) -> Result<Value> {
        match &call.tool {
            Tool::JobStatus { job } => self.job_status(job).await,
            Tool::Troubleshoot { job } => {
                let (status, log, dependencies) = tokio::try_join!(
                    self.job_status(job),
                    self.job_log(job),
                    self.graph.dependency_chain(job)
                )?;
                Ok(json!({ "status": status, "log": log, "dependencies": dependencies }))
            }
            Tool::DependencyChain { job } => {
                let dependencies = self.graph.dependency_chain(job).await?;
                Ok(json!({ "job": job, "dependencies": dependencies }))
            }
            Tool::Impact { job } => Ok(serde_json::to_value(
                self.graph.impact_analysis(job).await?,
            )?),
            Tool::CriticalJobs { limit } => {
                let jobs = self.graph.critical_jobs(*limit).await?;
                Ok(json!({ "jobs": jobs }))
            }
            Tool::CommonDependencies { jobs } => {
                let common = self.graph.common_dependencies(jobs).await?;
                Ok(json!({ "jobs": jobs, "common": common }))
            }
            Tool::Workstations { job: Some(job) } => {
                let workstations = self.graph.workstations_for(job).await?;
                Ok(json!({ "job": job, "workstations": workstations }))
            }
            Tool::Workstations { job: None } => {
                let gateway = Arc::clone(&self.gateway);
                let value = self
                    .graph
                    .cached(QueryType::Workstations, &[], move || async move {
                        gateway.workload(WorkloadOp::ListWorkstations).await
                    })
                    .await?;
                Ok(value.as_ref().clone())
            }
            Tool::JobAction { job, action } => {
                let result = self
                    .gateway
                    .workload(WorkloadOp::Action {
                        job: job.clone(),
                        action: *action,
                        idempotency_key: call.id.clone(),
                    })
                    .await?;
                self.graph.invalidate(QueryType::JobStatus);
                Ok(result)
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("profile", &self.config.profile)
            .field("active_drivers", &self.drivers.len())
            .finish()
    }
}

