use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;

/// One result row as produced by the store. Column order is preserved.
pub type Row = serde_json::Map<String, serde_json::Value>;

const HEALTH_CAPACITY: usize = 64;

/// A complete, versioned result set covering every catalog query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u64,
    pub generated_at: DateTime<Utc>,
    pub data: BTreeMap<String, Vec<Row>>,
}

impl Snapshot {
    pub fn new(version: u64, generated_at: DateTime<Utc>, data: BTreeMap<String, Vec<Row>>) -> Self {
        Self {
            version,
            generated_at,
            data,
        }
    }

    pub fn rows(&self, query: &str) -> Option<&[Row]> {
        self.data.get(query).map(Vec::as_slice)
    }

    pub fn query_names(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Holds the last published snapshot and a short history of refresh failures.
pub struct SnapshotBus {
    snapshot_tx: watch::Sender<Option<Arc<Snapshot>>>,
    snapshot_rx: watch::Receiver<Option<Arc<Snapshot>>>,
    health_tx: watch::Sender<VecDeque<String>>,
    health_rx: watch::Receiver<VecDeque<String>>,
}

impl Default for SnapshotBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotBus {
    pub fn new() -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let (health_tx, health_rx) = watch::channel(VecDeque::with_capacity(HEALTH_CAPACITY));
        Self {
            snapshot_tx,
            snapshot_rx,
            health_tx,
            health_rx,
        }
    }

    /// Replaces the current snapshot. Returns `false` (and keeps the current
    /// one) when `snap` is not strictly newer.
    pub fn publish(&self, snap: Arc<Snapshot>) -> bool {
        self.snapshot_tx.send_if_modified(|current| {
            let newer = current
                .as_ref()
                .is_none_or(|existing| snap.version > existing.version);
            if newer {
                *current = Some(Arc::clone(&snap));
            }
            newer
        })
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshot_rx.clone()
    }

    pub fn last_version(&self) -> u64 {
        self.snapshot_rx
            .borrow()
            .as_ref()
            .map_or(0, |snap| snap.version)
    }

    pub fn last_generated_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot_rx
            .borrow()
            .as_ref()
            .map(|snap| snap.generated_at)
    }

    pub fn push_health(&self, msg: impl Into<String>) {
        let msg = msg.into();
        self.health_tx.send_modify(|buf| {
            if buf.len() >= HEALTH_CAPACITY {
                let _ = buf.pop_front();
            }
            buf.push_back(msg);
        });
    }

    pub fn current_health(&self) -> Vec<String> {
        self.health_rx.borrow().iter().cloned().collect()
    }
}
