//! Integration test: audit ledger under concurrent flaggers and reviewers.

use std::sync::Arc;

use opsflow_core::{semantic_key, AuditLedger, AuditStatus, DecisionOutcome};
use serde_json::json;

fn ledger() -> (AuditLedger, sled::Db) {
    let db = sled::Config::new().temporary(true).open().unwrap();
    (AuditLedger::open(&db).unwrap(), db)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_flags_insert_one_item() {
    let (ledger, _db) = ledger();
    let ledger = Arc::new(ledger);
    let payload = json!({ "job": "PAYROLL_DAILY", "action": "rerun", "environment": "production" });

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let ledger = Arc::clone(&ledger);
        let payload = payload.clone();
        tasks.push(tokio::spawn(async move { ledger.flag("t1", payload).await }));
    }
    let mut ids = Vec::new();
    let mut inserted = 0;
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        if outcome.inserted() {
            inserted += 1;
        }
        ids.push(outcome.id().to_string());
    }
    assert_eq!(inserted, 1);
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(ledger.pending().await.unwrap().len(), 1);
}

#[tokio::test]
async fn key_order_does_not_change_the_fingerprint() {
    let a = json!({ "job": "A", "action": "hold" });
    let b = json!({ "action": "hold", "job": "A" });
    assert_eq!(semantic_key("t1", &a), semantic_key("t1", &b));
    assert_ne!(semantic_key("t1", &a), semantic_key("t2", &a));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_reviewers_apply_exactly_one_decision() {
    let (ledger, _db) = ledger();
    let ledger = Arc::new(ledger);
    let id = ledger
        .flag("t1", json!({ "job": "A", "action": "kill" }))
        .await
        .unwrap()
        .id()
        .to_string();

    let mut tasks = Vec::new();
    for i in 0..10 {
        let ledger = Arc::clone(&ledger);
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                ledger.approve(&id, &format!("reviewer-{}", i)).await
            } else {
                ledger.reject(&id, &format!("reviewer-{}", i), "no").await
            }
        }));
    }
    let mut applied = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            DecisionOutcome::Applied => applied += 1,
            DecisionOutcome::AlreadyDecided => {}
            DecisionOutcome::NotFound => panic!("item vanished"),
        }
    }
    assert_eq!(applied, 1);

    let item = ledger.get(&id).await.unwrap().unwrap();
    assert_ne!(item.status, AuditStatus::Pending);
    assert!(item.reviewer.is_some());
    assert!(ledger.pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn pending_is_fifo_and_decisions_are_broadcast() {
    let (ledger, _db) = ledger();
    let mut events = ledger.subscribe();
    let mut ids = Vec::new();
    for job in ["A", "B", "C"] {
        let id = ledger
            .flag("t1", json!({ "job": job, "action": "hold" }))
            .await
            .unwrap()
            .id()
            .to_string();
        ids.push(id);
    }
    let pending: Vec<String> = ledger
        .pending()
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(pending, ids);

    ledger.approve(&ids[1], "alice").await.unwrap();
    let event = events.recv().await.unwrap();
    assert_eq!(event.item_id, ids[1]);
    assert_eq!(event.thread_id, "t1");
    assert_eq!(event.status, AuditStatus::Approved);

    let pending: Vec<String> = ledger
        .pending()
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(pending, vec![ids[0].clone(), ids[2].clone()]);
}

#[tokio::test]
async fn flagged_means_pending_or_rejected() {
    let (ledger, _db) = ledger();
    let payload = json!({ "job": "A", "action": "rerun" });
    let key = semantic_key("t1", &payload);
    assert!(!ledger.is_flagged(&key).await.unwrap());

    let id = ledger.flag("t1", payload.clone()).await.unwrap().id().to_string();
    assert!(ledger.is_flagged(&key).await.unwrap());

    ledger.reject(&id, "bob", "not now").await.unwrap();
    assert!(ledger.is_flagged(&key).await.unwrap());
    assert!(!ledger.is_approved(&id).await.unwrap());
    assert!(!ledger.is_pending(&id).await.unwrap());
}

#[tokio::test]
async fn unknown_items() {
    let (ledger, _db) = ledger();
    assert_eq!(
        ledger.approve("missing", "alice").await.unwrap(),
        DecisionOutcome::NotFound
    );
    assert!(ledger.is_approved("missing").await.is_err());
    assert!(ledger.get("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn items_survive_reopening_the_ledger() {
    let (ledger, db) = ledger();
    let id = ledger
        .flag("t1", json!({ "job": "A", "action": "release" }))
        .await
        .unwrap()
        .id()
        .to_string();
    drop(ledger);

    let reopened = AuditLedger::open(&db).unwrap();
    assert!(reopened.is_pending(&id).await.unwrap());
    let again = reopened
        .flag("t1", json!({ "job": "A", "action": "release" }))
        .await
        .unwrap();
    assert!(!again.inserted());
    assert_eq!(again.id(), id);
}
