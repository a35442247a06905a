//! Shared fixtures: scripted upstreams and an engine over a temporary sled database.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opsflow_core::{
    ClientHandle, CoreConfig, Environment, Gateway, GraphQueryService, InMemoryGraph,
    LanguageModel, Orchestrator, Profile, RetryConfig, SubmitOutcome, ThreadSummary,
    UpstreamError, WorkloadApi, WorkloadOp,
};
use opsflow_core::gateway::{Completion, CompletionRequest};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Workload API double
// ---------------------------------------------------------------------------

pub struct MockWorkload {
    pub status_calls: AtomicUsize,
    pub log_calls: AtomicUsize,
    pub action_calls: AtomicUsize,
    /// Remaining status calls that fail with a transient error.
    pub fail_status: AtomicUsize,
    /// Remaining action calls that time out after the request was recorded.
    pub fail_action: AtomicUsize,
    pub status_delay_ms: AtomicU64,
    pub status_body: Mutex<Value>,
    pub log_body: Mutex<Value>,
    pub action_keys: Mutex<Vec<String>>,
}

impl MockWorkload {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status_calls: AtomicUsize::new(0),
            log_calls: AtomicUsize::new(0),
            action_calls: AtomicUsize::new(0),
            fail_status: AtomicUsize::new(0),
            fail_action: AtomicUsize::new(0),
            status_delay_ms: AtomicU64::new(0),
            status_body: Mutex::new(json!({
                "status": "SUCC",
                "return_code": 0,
                "workstation": "WS01"
            })),
            log_body: Mutex::new(json!({ "content": "step 1 ok\nstep 2 ok" })),
            action_keys: Mutex::new(Vec::new()),
        })
    }

    pub fn set_status(&self, body: Value) {
        *self.status_body.lock().unwrap() = body;
    }

    pub fn set_log(&self, body: Value) {
        *self.log_body.lock().unwrap() = body;
    }

    pub fn fail_next_status(&self, n: usize) {
        self.fail_status.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_action(&self, n: usize) {
        self.fail_action.store(n, Ordering::SeqCst);
    }

    pub fn statuses(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn actions(&self) -> usize {
        self.action_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkloadApi for MockWorkload {
    async fn execute(&self, _client: &ClientHandle, op: &WorkloadOp) -> Result<Value, UpstreamError> {
        match op {
            WorkloadOp::JobStatus { job } => {
                self.status_calls.fetch_add(1, Ordering::SeqCst);
                let delay = self.status_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                let failing = self
                    .fail_status
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(UpstreamError::Transient("connection reset".into()));
                }
                let mut body = self.status_body.lock().unwrap().clone();
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("job".into(), json!(job));
                }
                Ok(body)
            }
            WorkloadOp::JobLog { .. } => {
                self.log_calls.fetch_add(1, Ordering::SeqCst);
                Ok(self.log_body.lock().unwrap().clone())
            }
            WorkloadOp::Action {
                idempotency_key, ..
            } => {
                let n = self.action_calls.fetch_add(1, Ordering::SeqCst) + 1;
                self.action_keys
                    .lock()
                    .unwrap()
                    .push(idempotency_key.clone());
                let timed_out = self
                    .fail_action
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if timed_out {
                    return Err(UpstreamError::Transient("timed out".into()));
                }
                Ok(json!({ "accepted": true, "request_id": format!("req-{}", n) }))
            }
            WorkloadOp::ListWorkstations => Ok(json!({ "workstations": ["WS01", "PRODWS01"] })),
            WorkloadOp::Dependencies { .. } => Ok(json!([])),
        }
    }
}

// ---------------------------------------------------------------------------
// Language model double
// ---------------------------------------------------------------------------

pub struct ScriptedModel {
    pub calls: AtomicUsize,
    replies: Mutex<VecDeque<String>>,
    fallback: String,
}

impl ScriptedModel {
    pub fn new(replies: &[&str], fallback: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            fallback: fallback.to_string(),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(
        &self,
        _client: &ClientHandle,
        _request: &CompletionRequest,
    ) -> Result<Completion, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(Completion {
            text,
            truncated: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

pub fn test_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.profile = Profile::Development;
    config.workload.base_url = "https://workload.invalid".into();
    config.llm.base_url = "https://llm.invalid".into();
    config.graph.base_url = "https://graph.invalid".into();
    config.retry = RetryConfig {
        max_retries: 3,
        base_backoff_ms: 1,
        max_backoff_ms: 5,
    };
    config.default_environment = Environment::Test;
    config.production_workstations = vec!["prodws01".into()];
    config
}

/// PAYROLL_DAILY <- EXTRACT <- LOAD_GL chain plus a workstation edge.
pub fn sample_graph() -> InMemoryGraph {
    let graph = InMemoryGraph::new();
    graph.depends_on("PAYROLL_DAILY", "EXTRACT");
    graph.depends_on("EXTRACT", "LOAD_GL");
    graph.depends_on("REPORT", "PAYROLL_DAILY");
    graph.runs_on("PAYROLL_DAILY", "WS01");
    graph
}

pub struct Harness {
    pub engine: Arc<Orchestrator>,
    pub workload: Arc<MockWorkload>,
    pub model: Option<Arc<ScriptedModel>>,
    pub graph: InMemoryGraph,
    pub config: CoreConfig,
    pub db: sled::Db,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_config(), None)
    }

    pub fn with(config: CoreConfig, model: Option<Arc<ScriptedModel>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("opsflow.db")).unwrap();
        let workload = MockWorkload::new();
        let graph = sample_graph();
        let engine = build_engine(&config, &db, &workload, model.clone(), &graph);
        Self {
            engine,
            workload,
            model,
            graph,
            config,
            db,
            _dir: dir,
        }
    }

    /// A fresh engine over the same database: nothing in memory survives, only checkpoints
    /// and ledger items.
    pub fn restart(&mut self) {
        self.engine = build_engine(
            &self.config,
            &self.db,
            &self.workload,
            self.model.clone(),
            &self.graph,
        );
    }

    pub async fn submit(&self, thread: &str, text: &str) -> SubmitOutcome {
        self.engine.submit_message(thread, text).await.unwrap()
    }

    pub async fn status(&self, thread: &str) -> ThreadSummary {
        self.engine.get_thread_status(thread).await.unwrap()
    }
}

pub fn build_engine(
    config: &CoreConfig,
    db: &sled::Db,
    workload: &Arc<MockWorkload>,
    model: Option<Arc<ScriptedModel>>,
    graph: &InMemoryGraph,
) -> Arc<Orchestrator> {
    let model = model.map(|m| m as Arc<dyn LanguageModel>);
    let gateway = Arc::new(
        Gateway::new(config, Arc::clone(workload) as Arc<dyn WorkloadApi>, model).unwrap(),
    );
    let graph = Arc::new(GraphQueryService::new(Arc::new(graph.clone()), config));
    Arc::new(Orchestrator::new(config.clone(), db, gateway, graph).unwrap())
}

/// Poll until `check` holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
