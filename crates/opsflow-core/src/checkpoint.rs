//! Insert-only checkpoint store.
//!
//! Keys are `{thread_id}/{seq:020}`: the zero-padded sequence keeps a thread's checkpoints in
//! order, so the latest is the last key under the thread prefix. Each write is a
//! `compare_and_swap` from "absent" on the next sequence key; the loser of two concurrent
//! writers for the same thread gets `ThreadBusy`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OpsError, Result};
use crate::shared::now_ms;

const CHECKPOINT_TREE: &str = "checkpoints";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Phase label after the transition.
    pub phase: String,
    /// Transition that produced this checkpoint.
    pub transition: String,
    #[serde(default)]
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub checkpoint_id: String,
    pub parent_id: Option<String>,
    pub seq: u64,
    pub state: Value,
    pub metadata: CheckpointMetadata,
    pub created_ms: i64,
    pub expires_ms: Option<i64>,
}

impl Checkpoint {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_ms.map(|e| e <= now_ms).unwrap_or(false)
    }
}

fn key(thread_id: &str, seq: u64) -> String {
    format!("{}/{:020}", thread_id, seq)
}

fn prefix(thread_id: &str) -> String {
    format!("{}/", thread_id)
}

fn check_thread_id(thread_id: &str) -> Result<()> {
    if thread_id.trim().is_empty() || thread_id.contains('/') {
        return Err(OpsError::Validation(format!(
            "invalid thread id {:?}",
            thread_id
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct CheckpointStore {
    tree: sled::Tree,
    retention: Duration,
}

impl CheckpointStore {
    pub fn open(db: &sled::Db, retention: Duration) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(CHECKPOINT_TREE)?,
            retention,
        })
    }

    /// Write the checkpoint following `parent` (or the first one for the thread).
    pub async fn append(
        &self,
        thread_id: &str,
        parent: Option<(u64, String)>,
        state: Value,
        metadata: CheckpointMetadata,
    ) -> Result<Checkpoint> {
        check_thread_id(thread_id)?;
        let created_ms = now_ms();
        let (seq, parent_id) = match parent {
            Some((seq, id)) => (seq + 1, Some(id)),
            None => (0, None),
        };
        let checkpoint = Checkpoint {
            thread_id: thread_id.to_string(),
            checkpoint_id: Uuid::new_v4().to_string(),
            parent_id,
            seq,
            state,
            metadata,
            created_ms,
            expires_ms: Some(created_ms.saturating_add(self.retention.as_millis() as i64)),
        };
        let bytes = serde_json::to_vec(&checkpoint)?;
        let k = key(thread_id, seq);
        let tree = self.tree.clone();
        let swapped = tokio::task::spawn_blocking(move || {
            tree.compare_and_swap(k.as_bytes(), None as Option<&[u8]>, Some(bytes))
        })
        .await??;
        if swapped.is_err() {
            warn!(target: "opsflow::checkpoint", thread_id, seq, "checkpoint slot already taken");
            return Err(OpsError::ThreadBusy(thread_id.to_string()));
        }
        debug!(
            target: "opsflow::checkpoint",
            thread_id,
            seq,
            phase = %checkpoint.metadata.phase,
            transition = %checkpoint.metadata.transition,
            "checkpoint committed"
        );
        Ok(checkpoint)
    }

    pub async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        check_thread_id(thread_id)?;
        let tree = self.tree.clone();
        let p = prefix(thread_id);
        tokio::task::spawn_blocking(move || -> Result<Option<Checkpoint>> {
            match tree.scan_prefix(p.as_bytes()).next_back() {
                Some(entry) => {
                    let (_, bytes) = entry?;
                    Ok(Some(serde_json::from_slice(&bytes)?))
                }
                None => Ok(None),
            }
        })
        .await?
    }

    /// All checkpoints of a thread, oldest first.
    pub async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        check_thread_id(thread_id)?;
        let tree = self.tree.clone();
        let p = prefix(thread_id);
        tokio::task::spawn_blocking(move || {
            tree.scan_prefix(p.as_bytes())
                .map(|entry| -> Result<Checkpoint> {
                    let (_, bytes) = entry?;
                    Ok(serde_json::from_slice(&bytes)?)
                })
                .collect::<Result<Vec<Checkpoint>>>()
        })
        .await?
    }

    /// Remove expired checkpoints. A thread's latest checkpoint is kept while the thread is
    /// not terminal, since it is the resumption point. Returns the number removed.
    pub async fn collect_expired(&self, now_ms: i64) -> Result<usize> {
        let tree = self.tree.clone();
        let removed = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut latest: HashMap<String, u64> = HashMap::new();
            let mut expired: Vec<(String, u64, bool)> = Vec::new();
            for entry in tree.iter() {
                let (_, bytes) = entry?;
                let cp: Checkpoint = serde_json::from_slice(&bytes)?;
                let top = latest.entry(cp.thread_id.clone()).or_insert(cp.seq);
                *top = (*top).max(cp.seq);
                if cp.is_expired(now_ms) {
                    expired.push((cp.thread_id, cp.seq, cp.metadata.terminal));
                }
            }
            let mut removed = 0;
            for (thread_id, seq, terminal) in expired {
                let is_latest = latest.get(&thread_id) == Some(&seq);
                if is_latest && !terminal {
                    continue;
                }
                if tree.remove(key(&thread_id, seq).as_bytes())?.is_some() {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await??;
        if removed > 0 {
            info!(target: "opsflow::checkpoint", removed, "expired checkpoints collected");
        }
        Ok(removed)
    }
}
