use futures_util::future::BoxFuture;
use pulseboard::daemon::registry::{
    SubscriberId, SubscriberSendError, SubscriberSink, WatchSubscriber,
};
use pulseboard::daemon::snapshot::{Row, Snapshot};
use pulseboard::storage::memory::{MemoryStore, Script};
use pulseboard::storage::{Store, StoreError};
use pulseboard::{Engine, EngineOptions};
use pulseboard_core::{QueryCatalog, QuerySpec};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEBOUNCE: Duration = Duration::from_secs(1);
const TIMEOUT: Duration = Duration::from_secs(2);

fn row(value: Value) -> Row {
    value.as_object().cloned().expect("object row")
}

fn catalog(names: &[&str]) -> QueryCatalog {
    let mut catalog = QueryCatalog::new();
    for name in names {
        catalog
            .register(QuerySpec::warehouse(*name, format!("SELECT * FROM {name}")))
            .expect("unique name");
    }
    catalog
}

fn options() -> EngineOptions {
    EngineOptions {
        debounce: DEBOUNCE,
        query_timeout: TIMEOUT,
        max_concurrent_queries: 4,
    }
}

fn example_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.set_rows("A", vec![row(json!({"x": 1}))]);
    store.set_rows("B", vec![row(json!({"y": 2}))]);
    store
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(10)).await;
}

fn version_of(rx: &tokio::sync::watch::Receiver<Option<Arc<Snapshot>>>) -> Option<u64> {
    rx.borrow().as_ref().map(|snap| snap.version)
}

#[derive(Default)]
struct RecordingSink {
    versions: Mutex<Vec<u64>>,
}

impl SubscriberSink for RecordingSink {
    fn send(&self, snapshot: Arc<Snapshot>) -> Result<(), SubscriberSendError> {
        self.versions.lock().unwrap().push(snapshot.version);
        Ok(())
    }
}

struct BrokenSink;

impl SubscriberSink for BrokenSink {
    fn send(&self, _snapshot: Arc<Snapshot>) -> Result<(), SubscriberSendError> {
        Err(SubscriberSendError::Disconnected)
    }
}

#[tokio::test(start_paused = true)]
async fn example_scenario_delivers_complete_snapshot() {
    let store = example_store();
    let engine = Engine::start(catalog(&["A", "B"]), store.clone(), options());
    let (sink, rx) = WatchSubscriber::channel();
    engine.connect(Arc::new(sink)).unwrap();

    engine.notify_changed();
    settle().await;

    let snap = rx.borrow().clone().expect("snapshot delivered");
    assert_eq!(snap.version, 1);
    assert_eq!(
        serde_json::to_value(&snap.data).unwrap(),
        json!({"A": [{"x": 1}], "B": [{"y": 2}]})
    );
    // Connect and notify fell in the same window: one fan-out.
    assert_eq!(store.executions(), 2);
    assert_eq!(engine.status().last_version, 1);
}

#[tokio::test(start_paused = true)]
async fn burst_of_change_signals_produces_one_refresh() {
    let store = example_store();
    let engine = Engine::start(catalog(&["A", "B"]), store.clone(), options());

    for _ in 0..50 {
        engine.notify_changed();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.executions(), 0);
    settle().await;

    assert_eq!(store.executions(), 2);
    assert_eq!(engine.snapshot().expect("published").version, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_query_keeps_previous_snapshot_and_next_signal_retries() {
    let store = example_store();
    let engine = Engine::start(catalog(&["A", "B"]), store.clone(), options());
    let (sink, rx) = WatchSubscriber::channel();
    engine.connect(Arc::new(sink)).unwrap();
    settle().await;
    assert_eq!(version_of(&rx), Some(1));

    store.set(
        "B",
        Script::rows(vec![row(json!({"y": 3}))]).after(Duration::from_secs(60)),
    );
    engine.notify_changed();
    settle().await;

    let status = engine.status();
    assert_eq!(status.last_version, 1);
    assert_eq!(status.recent_failures.len(), 1);
    assert!(status.recent_failures[0].contains("'B'"));
    assert!(!status.is_refreshing);
    assert_eq!(version_of(&rx), Some(1));

    store.set_rows("B", vec![row(json!({"y": 3}))]);
    engine.notify_changed();
    settle().await;

    let snap = rx.borrow().clone().expect("snapshot");
    assert_eq!(snap.version, 2);
    assert_eq!(snap.rows("B"), Some(&[row(json!({"y": 3}))][..]));
}

#[tokio::test(start_paused = true)]
async fn one_failing_query_among_five_publishes_nothing() {
    let store = Arc::new(MemoryStore::new());
    for name in ["q1", "q2", "q3", "q5"] {
        store.set_rows(name, vec![row(json!({"n": 1}))]);
    }
    store.set("q4", Script::fail("relation does not exist"));
    let engine = Engine::start(
        catalog(&["q1", "q2", "q3", "q4", "q5"]),
        store.clone(),
        options(),
    );
    let recorder = Arc::new(RecordingSink::default());
    engine.connect(recorder.clone()).unwrap();

    engine.notify_changed();
    settle().await;

    assert!(recorder.versions.lock().unwrap().is_empty());
    assert!(engine.snapshot().is_none());
    assert_eq!(engine.status().last_version, 0);
}

struct GaugeStore {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    latency: Duration,
}

impl Store for GaugeStore {
    fn execute<'a>(&'a self, _spec: &'a QuerySpec) -> BoxFuture<'a, Result<Vec<Row>, StoreError>> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![row(json!({"ok": true}))])
        })
    }
}

#[tokio::test(start_paused = true)]
async fn refreshes_never_overlap_under_sustained_signals() {
    // One query per refresh, so concurrent executions == concurrent refreshes.
    let store = Arc::new(GaugeStore {
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        latency: Duration::from_millis(1500),
    });
    let engine = Engine::start(catalog(&["only"]), store.clone(), options());
    let recorder = Arc::new(RecordingSink::default());
    engine.connect(recorder.clone()).unwrap();

    for i in 0..40 {
        engine.notify_changed();
        // Alternate short and long gaps so the window closes several times.
        let gap = if i % 4 == 3 { 1200 } else { 100 };
        tokio::time::sleep(Duration::from_millis(gap)).await;
    }
    settle().await;

    assert_eq!(store.peak.load(Ordering::SeqCst), 1);
    let versions = recorder.versions.lock().unwrap().clone();
    assert!(versions.len() >= 2, "{versions:?}");
    assert!(versions.windows(2).all(|w| w[0] < w[1]), "{versions:?}");
}

#[tokio::test(start_paused = true)]
async fn subscriber_joining_mid_refresh_is_served_within_one_cycle() {
    let store = example_store();
    store.set(
        "A",
        Script::rows(vec![row(json!({"x": 1}))]).after(Duration::from_secs(1)),
    );
    let engine = Engine::start(catalog(&["A", "B"]), store.clone(), options());
    let (early, early_rx) = WatchSubscriber::channel();
    engine.connect(Arc::new(early)).unwrap();

    // Refresh starts at t=1s and runs until t=2s.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(engine.status().is_refreshing);
    let (late, late_rx) = WatchSubscriber::channel();
    engine.connect(Arc::new(late)).unwrap();
    assert_eq!(version_of(&late_rx), None);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(version_of(&early_rx), Some(1));
    assert_eq!(version_of(&late_rx), Some(1));

    settle().await;
    assert_eq!(version_of(&late_rx), Some(2));
}

#[tokio::test(start_paused = true)]
async fn new_subscriber_gets_latest_snapshot_immediately() {
    let engine = Engine::start(catalog(&["A", "B"]), example_store(), options());
    engine.notify_changed();
    settle().await;

    let (sink, rx) = WatchSubscriber::channel();
    engine.connect(Arc::new(sink)).unwrap();
    assert_eq!(version_of(&rx), Some(1));
}

#[tokio::test(start_paused = true)]
async fn failed_send_does_not_block_other_subscribers() {
    let engine = Engine::start(catalog(&["A", "B"]), example_store(), options());
    let first = Arc::new(RecordingSink::default());
    let second = Arc::new(RecordingSink::default());
    engine.connect(first.clone()).unwrap();
    engine.connect(Arc::new(BrokenSink)).unwrap();
    engine.connect(second.clone()).unwrap();
    assert_eq!(engine.status().connected_subscribers, 3);

    settle().await;

    assert_eq!(*first.versions.lock().unwrap(), vec![1]);
    assert_eq!(*second.versions.lock().unwrap(), vec![1]);
    assert_eq!(engine.status().connected_subscribers, 2);
}

#[tokio::test(start_paused = true)]
async fn versions_seen_by_a_subscriber_never_decrease() {
    let engine = Engine::start(catalog(&["A", "B"]), example_store(), options());
    let recorder = Arc::new(RecordingSink::default());
    engine.connect(recorder.clone()).unwrap();

    for _ in 0..5 {
        settle().await;
        // Late joiners trigger replies and refreshes interleaved with broadcasts.
        engine.connect(Arc::new(RecordingSink::default())).unwrap();
        engine.notify_changed();
    }
    settle().await;

    let versions = recorder.versions.lock().unwrap().clone();
    assert!(!versions.is_empty());
    assert!(versions.windows(2).all(|w| w[0] <= w[1]), "{versions:?}");
    assert_eq!(versions.last().copied(), Some(engine.status().last_version));
}

#[tokio::test(start_paused = true)]
async fn explicit_refresh_requires_a_known_subscriber() {
    let store = example_store();
    let engine = Engine::start(catalog(&["A", "B"]), store.clone(), options());

    assert!(engine.request_refresh(SubscriberId(5)).is_err());
    settle().await;
    assert_eq!(store.executions(), 0);

    let (sink, rx) = WatchSubscriber::channel();
    let id = engine.connect(Arc::new(sink)).unwrap();
    settle().await;
    assert_eq!(version_of(&rx), Some(1));

    engine.request_refresh(id).expect("known subscriber");
    settle().await;
    assert_eq!(version_of(&rx), Some(2));

    engine.disconnect(id);
    engine.disconnect(id);
    assert!(engine.request_refresh(id).is_err());
}

#[tokio::test(start_paused = true)]
async fn no_broadcasts_after_shutdown() {
    let store = example_store();
    store.set(
        "A",
        Script::rows(vec![row(json!({"x": 1}))]).after(Duration::from_millis(1500)),
    );
    let engine = Engine::start(catalog(&["A", "B"]), store.clone(), options());
    let recorder = Arc::new(RecordingSink::default());
    engine.connect(recorder.clone()).unwrap();

    // Shut down while the first refresh is in flight.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    engine.shutdown().await;
    engine.notify_changed();
    settle().await;

    assert!(recorder.versions.lock().unwrap().is_empty());
    assert!(engine.snapshot().is_none());
    assert_eq!(engine.status().connected_subscribers, 0);
}

#[tokio::test(start_paused = true)]
async fn connect_is_refused_after_shutdown() {
    let engine = Engine::start(catalog(&["A", "B"]), example_store(), options());
    engine.notify_changed();
    settle().await;
    engine.shutdown().await;

    let recorder = Arc::new(RecordingSink::default());
    assert!(engine.connect(recorder.clone()).is_err());
    assert!(recorder.versions.lock().unwrap().is_empty());
    assert_eq!(engine.status().connected_subscribers, 0);
}
