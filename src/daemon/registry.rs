use crate::daemon::snapshot::Snapshot;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriberSendError {
    #[error("subscriber disconnected")]
    Disconnected,
    #[error("subscriber rejected snapshot: {0}")]
    Rejected(String),
    #[error("unknown subscriber {0}")]
    Unknown(SubscriberId),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("subscriber registry is closed")]
pub struct RegistryClosed;

/// Send side of one live connection.
pub trait SubscriberSink: Send + Sync {
    fn send(&self, snapshot: Arc<Snapshot>) -> Result<(), SubscriberSendError>;
}

/// Channel-backed subscriber. The receiver only ever observes the newest
/// snapshot offered to it, and never a version lower than one it has seen.
pub struct WatchSubscriber {
    tx: watch::Sender<Option<Arc<Snapshot>>>,
}

impl WatchSubscriber {
    pub fn channel() -> (Self, watch::Receiver<Option<Arc<Snapshot>>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }
}

impl SubscriberSink for WatchSubscriber {
    fn send(&self, snapshot: Arc<Snapshot>) -> Result<(), SubscriberSendError> {
        if self.tx.is_closed() {
            return Err(SubscriberSendError::Disconnected);
        }
        self.tx.send_if_modified(|current| {
            let newer = current
                .as_ref()
                .is_none_or(|seen| snapshot.version > seen.version);
            if newer {
                *current = Some(Arc::clone(&snapshot));
            }
            newer
        });
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: Vec<SubscriberId>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    subscribers: HashMap<SubscriberId, Arc<dyn SubscriberSink>>,
    closed: bool,
}

/// The set of connected subscribers. All access goes through one lock.
#[derive(Default)]
pub struct SubscriberRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, sink: Arc<dyn SubscriberSink>) -> Result<SubscriberId, RegistryClosed> {
        self.add_with(sink, || None)
    }

    /// Registers `sink` and hands it `initial()`, all under the registry lock.
    /// Broadcasts take the same lock, so the initial snapshot can never land
    /// after a newer broadcast.
    pub fn add_with<F>(&self, sink: Arc<dyn SubscriberSink>, initial: F) -> Result<SubscriberId, RegistryClosed>
    where
        F: FnOnce() -> Option<Arc<Snapshot>>,
    {
        let mut inner = self.lock();
        if inner.closed {
            debug!("Registry closed; refusing new subscriber");
            return Err(RegistryClosed);
        }
        inner.next_id += 1;
        let id = SubscriberId(inner.next_id);
        if let Some(snapshot) = initial() {
            if let Err(e) = sink.send(snapshot) {
                warn!("Initial snapshot for {} not delivered: {}", id, e);
                return Ok(id);
            }
        }
        inner.subscribers.insert(id, sink);
        let connected = inner.subscribers.len();
        drop(inner);
        info!("Subscriber {} connected ({} connected)", id, connected);
        Ok(id)
    }

    /// Returns whether the subscriber was registered. Removing an absent id is
    /// not an error.
    pub fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.lock().subscribers.remove(&id).is_some();
        if removed {
            info!("Subscriber {} disconnected", id);
        }
        removed
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.lock().subscribers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().subscribers.is_empty()
    }

    /// Delivers `snapshot` to every subscriber. Failed sends drop that
    /// subscriber only; the rest still receive the snapshot.
    pub fn broadcast(&self, snapshot: &Arc<Snapshot>) -> BroadcastReport {
        let mut inner = self.lock();
        let mut report = BroadcastReport::default();
        if inner.closed {
            debug!("Registry closed; dropping broadcast of v{}", snapshot.version);
            return report;
        }
        for (id, sink) in inner.subscribers.iter() {
            match sink.send(Arc::clone(snapshot)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Dropping subscriber {} after failed send: {}", id, e);
                    report.removed.push(*id);
                }
            }
        }
        for id in &report.removed {
            inner.subscribers.remove(id);
        }
        report
    }

    /// Sends `snapshot` to a single subscriber, removing it on failure.
    pub fn reply(&self, id: SubscriberId, snapshot: &Arc<Snapshot>) -> Result<(), SubscriberSendError> {
        let mut inner = self.lock();
        let sink = inner
            .subscribers
            .get(&id)
            .map(Arc::clone)
            .ok_or(SubscriberSendError::Unknown(id))?;
        if let Err(e) = sink.send(Arc::clone(snapshot)) {
            inner.subscribers.remove(&id);
            warn!("Dropping subscriber {} after failed reply: {}", id, e);
            return Err(e);
        }
        Ok(())
    }

    /// Stops all further deliveries and forgets every subscriber.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        let dropped = inner.subscribers.len();
        inner.subscribers.clear();
        drop(inner);
        info!("Subscriber registry closed ({} subscribers released)", dropped);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
