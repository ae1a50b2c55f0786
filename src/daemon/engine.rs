use crate::daemon::assembler::{QueryExecutionError, SnapshotAssembler};
use crate::daemon::coalescer::{PhaseKind, RefreshCoalescer, RefreshError, RefreshJob};
use crate::daemon::registry::{RegistryClosed, SubscriberId, SubscriberRegistry, SubscriberSink};
use crate::daemon::snapshot::{Row, Snapshot, SnapshotBus};
use crate::storage::Store;
use crate::util::config::AppConfig;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use pulseboard_core::QueryCatalog;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("unknown subscriber {0}")]
pub struct UnknownSubscriber(pub SubscriberId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub debounce: Duration,
    pub query_timeout: Duration,
    pub max_concurrent_queries: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            query_timeout: Duration::from_secs(10),
            max_concurrent_queries: 8,
        }
    }
}

impl From<&AppConfig> for EngineOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            debounce: config.debounce(),
            query_timeout: config.query_timeout(),
            max_concurrent_queries: config.max_concurrent_queries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub is_refreshing: bool,
    pub phase: PhaseKind,
    pub connected_subscribers: usize,
    pub last_version: u64,
    pub last_generated_at: Option<DateTime<Utc>>,
    pub recent_failures: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Assembles a snapshot and hands it to every subscriber.
struct Publisher {
    assembler: SnapshotAssembler,
    registry: Arc<SubscriberRegistry>,
    bus: Arc<SnapshotBus>,
}

impl RefreshJob for Publisher {
    fn refresh(&self, version: u64) -> BoxFuture<'_, Result<(), RefreshError>> {
        Box::pin(async move {
            let snapshot = match self.assembler.assemble(version).await {
                Ok(snapshot) => Arc::new(snapshot),
                Err(e) => {
                    self.bus
                        .push_health(format!("{} v{}: {}", Utc::now().to_rfc3339(), version, e));
                    return Err(e.into());
                }
            };
            if self.registry.is_closed() {
                return Err(RefreshError::ShuttingDown);
            }
            if !self.bus.publish(Arc::clone(&snapshot)) {
                warn!(
                    "Snapshot v{} is not newer than v{}; not publishing",
                    version,
                    self.bus.last_version()
                );
                return Ok(());
            }
            let report = self.registry.broadcast(&snapshot);
            info!(
                "Broadcast v{} to {} subscribers ({} dropped)",
                version,
                report.delivered,
                report.removed.len()
            );
            Ok(())
        })
    }
}

struct EngineInner {
    publisher: Arc<Publisher>,
    registry: Arc<SubscriberRegistry>,
    bus: Arc<SnapshotBus>,
    coalescer: RefreshCoalescer,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Wires change signals and subscriber lifecycle into the refresh pipeline.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Must be called from within a tokio runtime.
    pub fn start(catalog: QueryCatalog, store: Arc<dyn Store>, options: EngineOptions) -> Self {
        let catalog = Arc::new(catalog);
        if catalog.is_empty() {
            warn!("Starting engine with an empty query catalog");
        }
        info!(
            "Starting engine: {} queries, debounce {:?}, query timeout {:?}, {} concurrent",
            catalog.len(),
            options.debounce,
            options.query_timeout,
            options.max_concurrent_queries
        );
        let registry = Arc::new(SubscriberRegistry::new());
        let bus = Arc::new(SnapshotBus::new());
        let publisher = Arc::new(Publisher {
            assembler: SnapshotAssembler::new(
                catalog,
                store,
                options.query_timeout,
                options.max_concurrent_queries,
            ),
            registry: Arc::clone(&registry),
            bus: Arc::clone(&bus),
        });
        let (coalescer, driver) = RefreshCoalescer::spawn(options.debounce, Arc::clone(&publisher));
        Self {
            inner: Arc::new(EngineInner {
                publisher,
                registry,
                bus,
                coalescer,
                driver: Mutex::new(Some(driver)),
            }),
        }
    }

    /// Called by mutation handlers after their write commits.
    pub fn notify_changed(&self) {
        self.inner.coalescer.request();
    }

    /// Registers a subscriber, hands it the latest snapshot if there is one,
    /// and requests a fresh one. Fails once the engine has shut down.
    pub fn connect(&self, sink: Arc<dyn SubscriberSink>) -> Result<SubscriberId, RegistryClosed> {
        let bus = &self.inner.bus;
        let id = self.inner.registry.add_with(sink, || bus.snapshot())?;
        self.inner.coalescer.request();
        Ok(id)
    }

    pub fn disconnect(&self, id: SubscriberId) {
        self.inner.registry.remove(id);
    }

    /// Explicit pull from one subscriber; coalesced like any change signal.
    pub fn request_refresh(&self, id: SubscriberId) -> Result<(), UnknownSubscriber> {
        if !self.inner.registry.contains(id) {
            return Err(UnknownSubscriber(id));
        }
        debug!("Subscriber {} requested a refresh", id);
        self.inner.coalescer.request();
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        let refresh = self.inner.coalescer.state();
        EngineStatus {
            is_refreshing: refresh.running(),
            phase: refresh.phase,
            connected_subscribers: self.inner.registry.len(),
            last_version: self.inner.bus.last_version(),
            last_generated_at: self.inner.bus.last_generated_at(),
            recent_failures: self.inner.bus.current_health(),
            timestamp: Utc::now(),
        }
    }

    /// Runs one catalog query on its own, outside the refresh cycle.
    pub async fn query(&self, name: &str) -> Result<Vec<Row>, QueryExecutionError> {
        self.inner.publisher.assembler.run_named(name).await
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.bus.snapshot()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.inner.bus.watch_snapshot()
    }

    /// Stops accepting requests, suppresses further broadcasts, and waits for
    /// any in-flight refresh to finish.
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.inner.coalescer.shutdown();
        self.inner.registry.close();
        let driver = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!("Refresh driver ended abnormally: {}", e);
            }
        }
        info!("Engine stopped");
    }
}
