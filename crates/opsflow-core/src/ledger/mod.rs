//! Audit/approval ledger: the single record of flag and approval status.
//!
//! Backed by three sled trees sharing the engine's database:
//!
//! | Tree | Key | Value |
//! |------|-----|-------|
//! | `audit_items` | item id | JSON [`AuditItem`] |
//! | `audit_keys` | semantic key | id of the latest item for that key |
//! | `audit_queue` | sled-generated sequence (big-endian) | item id of a pending item |
//!
//! Every status gate is a sled `compare_and_swap`, so callers never need an external lock:
//! `flag` swaps the semantic-key slot from the value it observed to the new id, and decisions
//! swap the serialized item from its pending bytes to the decided bytes. Losers re-read.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{OpsError, Result};
use crate::shared::now_ms;

const ITEMS_TREE: &str = "audit_items";
const KEYS_TREE: &str = "audit_keys";
const QUEUE_TREE: &str = "audit_queue";
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditItem {
    pub id: String,
    pub semantic_key: String,
    pub thread_id: String,
    pub payload: Value,
    pub status: AuditStatus,
    pub created_ms: i64,
    #[serde(default)]
    pub reviewer: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub decided_ms: Option<i64>,
    pub queue_seq: u64,
}

/// Result of [`AuditLedger::flag`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlagOutcome {
    Inserted(String),
    /// A pending item already covers this thread and payload.
    AlreadyExists(String),
}

impl FlagOutcome {
    pub fn id(&self) -> &str {
        match self {
            FlagOutcome::Inserted(id) | FlagOutcome::AlreadyExists(id) => id,
        }
    }

    pub fn inserted(&self) -> bool {
        matches!(self, FlagOutcome::Inserted(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    Applied,
    NotFound,
    AlreadyDecided,
}

/// Emitted after a decision is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEvent {
    pub item_id: String,
    pub thread_id: String,
    pub status: AuditStatus,
}

/// Fingerprint of a thread id and the canonical JSON of a payload.
pub fn semantic_key(thread_id: &str, payload: &Value) -> String {
    // serde_json maps are ordered, so equal payloads serialize identically.
    let canonical = payload.to_string();
    let mut hasher = DefaultHasher::new();
    thread_id.hash(&mut hasher);
    canonical.hash(&mut hasher);
    format!("{}:{:016x}", thread_id, hasher.finish())
}

#[derive(Clone)]
struct LedgerTrees {
    db: sled::Db,
    items: sled::Tree,
    keys: sled::Tree,
    queue: sled::Tree,
}

impl LedgerTrees {
    fn read_item(&self, id: &str) -> Result<Option<AuditItem>> {
        match self.items.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn flag(&self, thread_id: &str, payload: &Value) -> Result<FlagOutcome> {
        let key = semantic_key(thread_id, payload);
        loop {
            let observed = self.keys.get(key.as_bytes())?;
            if let Some(bytes) = &observed {
                let existing = String::from_utf8_lossy(bytes).into_owned();
                if let Some(item) = self.read_item(&existing)? {
                    if item.status == AuditStatus::Pending {
                        return Ok(FlagOutcome::AlreadyExists(existing));
                    }
                }
            }

            let id = Uuid::new_v4().to_string();
            let queue_seq = self.db.generate_id()?;
            let item = AuditItem {
                id: id.clone(),
                semantic_key: key.clone(),
                thread_id: thread_id.to_string(),
                payload: payload.clone(),
                status: AuditStatus::Pending,
                created_ms: now_ms(),
                reviewer: None,
                reason: None,
                decided_ms: None,
                queue_seq,
            };
            self.items.insert(id.as_bytes(), serde_json::to_vec(&item)?)?;

            match self
                .keys
                .compare_and_swap(key.as_bytes(), observed.as_ref(), Some(id.as_bytes()))?
            {
                Ok(()) => {
                    self.queue.insert(queue_seq.to_be_bytes(), id.as_bytes())?;
                    return Ok(FlagOutcome::Inserted(id));
                }
                Err(_) => {
                    // Another flagger moved the slot; drop our provisional item and re-read.
                    self.items.remove(id.as_bytes())?;
                }
            }
        }
    }

    fn decide(
        &self,
        id: &str,
        status: AuditStatus,
        reviewer: &str,
        reason: Option<String>,
    ) -> Result<(DecisionOutcome, Option<AuditItem>)> {
        loop {
            let bytes = match self.items.get(id.as_bytes())? {
                Some(b) => b,
                None => return Ok((DecisionOutcome::NotFound, None)),
            };
            let item: AuditItem = serde_json::from_slice(&bytes)?;
            if item.status != AuditStatus::Pending {
                return Ok((DecisionOutcome::AlreadyDecided, None));
            }
            let decided = AuditItem {
                status,
                reviewer: Some(reviewer.to_string()),
                reason: reason.clone(),
                decided_ms: Some(now_ms()),
                ..item
            };
            let swapped = self.items.compare_and_swap(
                id.as_bytes(),
                Some(&bytes),
                Some(serde_json::to_vec(&decided)?),
            )?;
            if swapped.is_ok() {
                self.queue.remove(decided.queue_seq.to_be_bytes())?;
                return Ok((DecisionOutcome::Applied, Some(decided)));
            }
        }
    }

    fn pending(&self) -> Result<Vec<AuditItem>> {
        let mut out = Vec::new();
        for entry in self.queue.iter() {
            let (_, id) = entry?;
            let id = String::from_utf8_lossy(&id).into_owned();
            if let Some(item) = self.read_item(&id)? {
                if item.status == AuditStatus::Pending {
                    out.push(item);
                }
            }
        }
        Ok(out)
    }

    fn item_for_key(&self, key: &str) -> Result<Option<AuditItem>> {
        match self.keys.get(key.as_bytes())? {
            Some(id) => self.read_item(&String::from_utf8_lossy(&id)),
            None => Ok(None),
        }
    }
}

/// Atomic flag/approve/reject over sled. Cheap to clone; clones share the same trees.
#[derive(Clone)]
pub struct AuditLedger {
    trees: LedgerTrees,
    events: broadcast::Sender<LedgerEvent>,
}

impl AuditLedger {
    pub fn open(db: &sled::Db) -> Result<Self> {
        let trees = LedgerTrees {
            db: db.clone(),
            items: db.open_tree(ITEMS_TREE)?,
            keys: db.open_tree(KEYS_TREE)?,
            queue: db.open_tree(QUEUE_TREE)?,
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self { trees, events })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&LedgerTrees) -> Result<T> + Send + 'static,
    {
        let trees = self.trees.clone();
        tokio::task::spawn_blocking(move || f(&trees)).await?
    }

    /// Insert a pending item unless one is already pending for the same thread and payload.
    pub async fn flag(&self, thread_id: &str, payload: Value) -> Result<FlagOutcome> {
        let thread = thread_id.to_string();
        let outcome = self
            .blocking(move |t| t.flag(&thread, &payload))
            .await?;
        match &outcome {
            FlagOutcome::Inserted(id) => {
                info!(target: "opsflow::ledger", thread_id, item_id = %id, "audit item flagged")
            }
            FlagOutcome::AlreadyExists(id) => {
                debug!(target: "opsflow::ledger", thread_id, item_id = %id, "audit item already pending")
            }
        }
        Ok(outcome)
    }

    pub async fn approve(&self, id: &str, reviewer: &str) -> Result<DecisionOutcome> {
        self.decide(id, AuditStatus::Approved, reviewer, None).await
    }

    pub async fn reject(&self, id: &str, reviewer: &str, reason: &str) -> Result<DecisionOutcome> {
        self.decide(id, AuditStatus::Rejected, reviewer, Some(reason.to_string()))
            .await
    }

    async fn decide(
        &self,
        id: &str,
        status: AuditStatus,
        reviewer: &str,
        reason: Option<String>,
    ) -> Result<DecisionOutcome> {
        let (item_id, who) = (id.to_string(), reviewer.to_string());
        let (outcome, decided) = self
            .blocking(move |t| t.decide(&item_id, status, &who, reason))
            .await?;
        if let Some(item) = decided {
            info!(target: "opsflow::ledger", item_id = %item.id, thread_id = %item.thread_id, status = ?status, reviewer, "audit item decided");
            // No subscribers is fine.
            let _ = self.events.send(LedgerEvent {
                item_id: item.id,
                thread_id: item.thread_id,
                status,
            });
        }
        Ok(outcome)
    }

    pub async fn get(&self, id: &str) -> Result<Option<AuditItem>> {
        let id = id.to_string();
        self.blocking(move |t| t.read_item(&id)).await
    }

    async fn status_of(&self, id: &str) -> Result<AuditStatus> {
        self.get(id)
            .await?
            .map(|item| item.status)
            .ok_or_else(|| OpsError::NotFound(format!("audit item {}", id)))
    }

    pub async fn is_approved(&self, id: &str) -> Result<bool> {
        Ok(self.status_of(id).await? == AuditStatus::Approved)
    }

    pub async fn is_pending(&self, id: &str) -> Result<bool> {
        Ok(self.status_of(id).await? == AuditStatus::Pending)
    }

    /// Informational: a pending or rejected item exists for the semantic key.
    pub async fn is_flagged(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        let item = self.blocking(move |t| t.item_for_key(&key)).await?;
        Ok(matches!(
            item.map(|i| i.status),
            Some(AuditStatus::Pending) | Some(AuditStatus::Rejected)
        ))
    }

    /// Pending items in flag order.
    pub async fn pending(&self) -> Result<Vec<AuditItem>> {
        self.blocking(|t| t.pending()).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }
}
