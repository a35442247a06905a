//! Integration test: once-only client construction and per-target circuit breaking.

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opsflow_core::{
    BreakerState, ClientHandle, CoreConfig, Gateway, OpsError, Profile, Target, UpstreamError,
    WorkloadApi, WorkloadOp,
};
use serde_json::{json, Value};

/// 0 = succeed, 1 = transient failure, otherwise reject with that HTTP status.
struct Switchable {
    mode: AtomicU16,
    calls: AtomicUsize,
}

impl Switchable {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mode: AtomicU16::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    fn set(&self, mode: u16) {
        self.mode.store(mode, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkloadApi for Switchable {
    async fn execute(&self, _client: &ClientHandle, _op: &WorkloadOp) -> Result<Value, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode.load(Ordering::SeqCst) {
            0 => Ok(json!({ "status": "SUCC" })),
            1 => Err(UpstreamError::Transient("timed out".into())),
            status => Err(UpstreamError::Rejected { status }),
        }
    }
}

fn config(threshold: u32, cooldown_ms: u64) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.profile = Profile::Development;
    config.workload.base_url = "https://workload.invalid".into();
    config.breaker.failure_threshold = threshold;
    config.breaker.cooldown_ms = cooldown_ms;
    config
}

fn status_op() -> WorkloadOp {
    WorkloadOp::JobStatus {
        job: "PAYROLL_DAILY".into(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_use_builds_one_client() {
    let gateway = Arc::new(Gateway::new(&config(5, 1_000), Switchable::new(), None).unwrap());

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let gateway = Arc::clone(&gateway);
        tasks.push(tokio::spawn(async move {
            gateway.get_client(Target::Workload).await
        }));
    }
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }
    assert_eq!(gateway.construction_count(Target::Workload), 1);
    assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(gateway.construction_count(Target::Graph), 0);
}

#[tokio::test]
async fn breaker_opens_fails_fast_and_recovers_through_a_probe() {
    let api = Switchable::new();
    let gateway = Gateway::new(&config(3, 100), api.clone(), None).unwrap();

    api.set(1);
    for _ in 0..3 {
        let err = gateway.workload(status_op()).await.unwrap_err();
        assert!(err.is_retryable());
    }
    assert_eq!(gateway.breaker_state(Target::Workload), BreakerState::Open);

    // Open: the backend is not touched.
    let err = gateway.workload(status_op()).await.unwrap_err();
    assert!(matches!(err, OpsError::CircuitOpen { .. }));
    assert_eq!(api.calls(), 3);

    // Other targets are unaffected.
    assert_eq!(gateway.breaker_state(Target::Graph), BreakerState::Closed);

    tokio::time::sleep(Duration::from_millis(150)).await;
    api.set(0);
    gateway.workload(status_op()).await.unwrap();
    assert_eq!(api.calls(), 4);
    assert_eq!(gateway.breaker_state(Target::Workload), BreakerState::Closed);
}

#[tokio::test]
async fn failed_probe_reopens() {
    let api = Switchable::new();
    let gateway = Gateway::new(&config(1, 50), api.clone(), None).unwrap();

    api.set(1);
    gateway.workload(status_op()).await.unwrap_err();
    assert_eq!(gateway.breaker_state(Target::Workload), BreakerState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;
    gateway.workload(status_op()).await.unwrap_err();
    assert_eq!(gateway.breaker_state(Target::Workload), BreakerState::Open);
    assert_eq!(api.calls(), 2);
}

#[tokio::test]
async fn client_errors_do_not_trip_the_breaker() {
    let api = Switchable::new();
    let gateway = Gateway::new(&config(2, 1_000), api.clone(), None).unwrap();

    api.set(404);
    for _ in 0..5 {
        let err = gateway.workload(status_op()).await.unwrap_err();
        assert!(matches!(err, OpsError::Upstream { status: 404, .. }));
        assert!(!err.is_retryable());
    }
    assert_eq!(gateway.breaker_state(Target::Workload), BreakerState::Closed);
    assert_eq!(api.calls(), 5);
}

#[tokio::test]
async fn insecure_tls_is_refused_in_production() {
    let mut prod = config(5, 1_000);
    prod.profile = Profile::Production;
    prod.tls.verify = false;
    prod.tls.allow_insecure_dev = true;
    assert!(matches!(
        Gateway::new(&prod, Switchable::new(), None),
        Err(OpsError::Configuration(_))
    ));

    let mut dev = config(5, 1_000);
    dev.tls.verify = false;
    assert!(Gateway::new(&dev, Switchable::new(), None).is_err());
    dev.tls.allow_insecure_dev = true;
    assert!(Gateway::new(&dev, Switchable::new(), None).is_ok());
}

#[tokio::test]
async fn model_calls_without_a_model_are_configuration_errors() {
    let gateway = Gateway::new(&config(5, 1_000), Switchable::new(), None).unwrap();
    assert!(!gateway.has_model());
    let request = gateway.completion_request("system", "hello");
    assert!(matches!(
        gateway.complete(request).await,
        Err(OpsError::Configuration(_))
    ));
}
