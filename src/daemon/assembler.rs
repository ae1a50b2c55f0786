use crate::daemon::snapshot::{Row, Snapshot};
use crate::storage::{Store, StoreError};
use chrono::Utc;
use futures_util::future::try_join_all;
use log::{debug, warn};
use pulseboard_core::{QueryCatalog, QuerySpec};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryFailure {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("query '{query}' failed: {cause}")]
pub struct QueryExecutionError {
    pub query: String,
    pub cause: QueryFailure,
}

impl QueryExecutionError {
    fn new(query: &str, cause: QueryFailure) -> Self {
        Self {
            query: query.to_string(),
            cause,
        }
    }
}

/// Runs the whole catalog against the store and builds one snapshot, or
/// nothing at all if any query fails.
pub struct SnapshotAssembler {
    catalog: Arc<QueryCatalog>,
    store: Arc<dyn Store>,
    permits: Arc<Semaphore>,
    query_timeout: Duration,
}

impl SnapshotAssembler {
    pub fn new(
        catalog: Arc<QueryCatalog>,
        store: Arc<dyn Store>,
        query_timeout: Duration,
        max_concurrent_queries: usize,
    ) -> Self {
        Self {
            catalog,
            store,
            permits: Arc::new(Semaphore::new(max_concurrent_queries.max(1))),
            query_timeout,
        }
    }

    pub fn catalog(&self) -> &QueryCatalog {
        &self.catalog
    }

    /// Issues every query concurrently. The first failure aborts the rest:
    /// dropping the joined future cancels the queries still pending.
    pub async fn assemble(&self, version: u64) -> Result<Snapshot, QueryExecutionError> {
        let started = Instant::now();
        let results = try_join_all(self.catalog.all().iter().map(|spec| self.run_query(spec))).await?;
        let data: BTreeMap<String, Vec<Row>> = results.into_iter().collect();
        debug!(
            "Assembled v{} from {} queries in {}ms",
            version,
            data.len(),
            started.elapsed().as_millis()
        );
        Ok(Snapshot::new(version, Utc::now(), data))
    }

    /// Executes a single catalog entry with the same timeout and pool as a
    /// full refresh.
    pub async fn run_named(&self, name: &str) -> Result<Vec<Row>, QueryExecutionError> {
        let spec = self.catalog.get(name).ok_or_else(|| {
            QueryExecutionError::new(name, QueryFailure::Store(StoreError::UnknownQuery(name.to_string())))
        })?;
        self.run_query(spec).await.map(|(_, rows)| rows)
    }

    async fn run_query(&self, spec: &QuerySpec) -> Result<(String, Vec<Row>), QueryExecutionError> {
        let _permit = self.permits.acquire().await.map_err(|_| {
            QueryExecutionError::new(
                &spec.name,
                QueryFailure::Store(StoreError::Unavailable("query pool closed".into())),
            )
        })?;
        let started = Instant::now();
        match tokio::time::timeout(self.query_timeout, self.store.execute(spec)).await {
            Ok(Ok(rows)) => {
                debug!(
                    "Query '{}' ({}) returned {} rows in {}ms",
                    spec.name,
                    spec.target,
                    rows.len(),
                    started.elapsed().as_millis()
                );
                Ok((spec.name.clone(), rows))
            }
            Ok(Err(e)) => {
                warn!("Query '{}' ({}) failed: {}", spec.name, spec.target, e);
                Err(QueryExecutionError::new(&spec.name, e.into()))
            }
            Err(_) => {
                warn!(
                    "Query '{}' ({}) timed out after {:?}",
                    spec.name, spec.target, self.query_timeout
                );
                Err(QueryExecutionError::new(
                    &spec.name,
                    QueryFailure::TimedOut(self.query_timeout),
                ))
            }
        }
    }
}
