use crate::{Store, StoreError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::future::BoxFuture;
use log::debug;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use serde_json::{Number, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

use pulseboard_core::{QuerySpec, QueryTarget, Row};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

enum Source {
    /// Database file; each execution opens its own connection so queries run
    /// in parallel under WAL.
    File(PathBuf),
    /// A single caller-supplied connection. Queries against it run one at a time.
    Shared(Arc<Mutex<Connection>>),
}

/// SQLite-backed store with one database per query target.
pub struct SqliteStore {
    warehouse: Source,
    operational: Source,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        warehouse_path: P,
        operational_path: Q,
    ) -> Result<Self, StoreError> {
        // Opening once up front creates the files and switches them to WAL.
        open_connection(warehouse_path.as_ref())?;
        open_connection(operational_path.as_ref())?;
        Ok(Self {
            warehouse: Source::File(warehouse_path.as_ref().to_path_buf()),
            operational: Source::File(operational_path.as_ref().to_path_buf()),
        })
    }

    pub fn from_connections(warehouse: Connection, operational: Connection) -> Self {
        Self {
            warehouse: Source::Shared(Arc::new(Mutex::new(warehouse))),
            operational: Source::Shared(Arc::new(Mutex::new(operational))),
        }
    }

    fn source(&self, target: QueryTarget) -> &Source {
        match target {
            QueryTarget::Warehouse => &self.warehouse,
            QueryTarget::Operational => &self.operational,
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("failed to create directory {:?}: {e}", parent))
            })?;
        }
    }
    let conn = Connection::open(path)
        .map_err(|e| StoreError::Unavailable(format!("failed to open {:?}: {e}", path)))?;
    init_connection(&conn)
        .map_err(|e| StoreError::Unavailable(format!("failed to configure {:?}: {e}", path)))?;
    Ok(conn)
}

fn init_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", -4000)?;
    Ok(())
}

fn open_reader(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| StoreError::Unavailable(format!("failed to open {:?}: {e}", path)))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| StoreError::Unavailable(format!("failed to configure {:?}: {e}", path)))?;
    Ok(conn)
}

fn run_statement(conn: &Connection, statement: &str) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(statement)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut mapped = Row::new();
        for (idx, column) in columns.iter().enumerate() {
            mapped.insert(column.clone(), json_value(row.get_ref(idx)?));
        }
        out.push(mapped);
    }
    Ok(out)
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(STANDARD.encode(bytes)),
    }
}

/// Interrupts the running statement if the caller stops waiting for it.
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            debug!("Interrupting abandoned SQLite statement");
            handle.interrupt();
        }
    }
}

async fn run_on_file(path: PathBuf, statement: String) -> Result<Vec<Row>, StoreError> {
    let (handle_tx, handle_rx) = oneshot::channel();
    let task = tokio::task::spawn_blocking(move || {
        let conn = open_reader(&path)?;
        // The caller went away before the statement started.
        if handle_tx.send(conn.get_interrupt_handle()).is_err() {
            return Err(StoreError::Unavailable("query abandoned before it started".into()));
        }
        run_statement(&conn, &statement).map_err(|e| StoreError::Query(e.to_string()))
    });
    let mut guard = InterruptOnDrop(handle_rx.await.ok());
    let joined = task.await;
    guard.disarm();
    joined.map_err(|e| StoreError::Unavailable(format!("query worker did not complete: {e}")))?
}

async fn run_on_shared(conn: Arc<Mutex<Connection>>, statement: String) -> Result<Vec<Row>, StoreError> {
    tokio::task::spawn_blocking(move || {
        let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
        run_statement(&guard, &statement).map_err(|e| StoreError::Query(e.to_string()))
    })
    .await
    .map_err(|e| StoreError::Unavailable(format!("query worker did not complete: {e}")))?
}

impl Store for SqliteStore {
    fn execute<'a>(&'a self, spec: &'a QuerySpec) -> BoxFuture<'a, Result<Vec<Row>, StoreError>> {
        let statement = spec.statement.clone();
        Box::pin(async move {
            let result = match self.source(spec.target) {
                Source::File(path) => run_on_file(path.clone(), statement).await,
                Source::Shared(conn) => run_on_shared(Arc::clone(conn), statement).await,
            };
            if let Ok(rows) = &result {
                debug!("query '{}' returned {} rows", spec.name, rows.len());
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn memory_store() -> SqliteStore {
        let warehouse = Connection::open_in_memory().unwrap();
        warehouse
            .execute_batch(
                "CREATE TABLE FactContentViews (UserKey INTEGER, ViewCount INTEGER, Ratio REAL, Tag TEXT, Raw BLOB);
                 INSERT INTO FactContentViews VALUES (1, 10, 0.5, 'a', x'0102');
                 INSERT INTO FactContentViews VALUES (2, 5, NULL, NULL, NULL);",
            )
            .unwrap();
        let operational = Connection::open_in_memory().unwrap();
        operational
            .execute_batch(
                "CREATE TABLE Users (UserId INTEGER, IsActive BOOLEAN);
                 INSERT INTO Users VALUES (1, TRUE), (2, FALSE), (3, TRUE);",
            )
            .unwrap();
        SqliteStore::from_connections(warehouse, operational)
    }

    #[tokio::test]
    async fn maps_sqlite_types_to_json_in_column_order() {
        let store = memory_store();
        let spec = QuerySpec::warehouse(
            "raw",
            "SELECT ViewCount AS views, Ratio, Tag, Raw FROM FactContentViews ORDER BY UserKey",
        );
        let rows = store.execute(&spec).await.expect("query");
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].keys().map(String::as_str).collect::<Vec<_>>(),
            ["views", "Ratio", "Tag", "Raw"]
        );
        assert_eq!(
            Value::Object(rows[0].clone()),
            json!({"views": 10, "Ratio": 0.5, "Tag": "a", "Raw": "AQI="})
        );
        assert_eq!(
            Value::Object(rows[1].clone()),
            json!({"views": 5, "Ratio": null, "Tag": null, "Raw": null})
        );
    }

    #[tokio::test]
    async fn routes_queries_by_target() {
        let store = memory_store();
        let spec = QuerySpec::operational(
            "activeUsers",
            "SELECT COUNT(*) AS count FROM Users WHERE IsActive = TRUE",
        );
        let rows = store.execute(&spec).await.expect("query");
        assert_eq!(Value::Object(rows[0].clone()), json!({"count": 2}));

        // The warehouse connection has no Users table.
        let wrong = QuerySpec::warehouse("activeUsers", "SELECT COUNT(*) FROM Users");
        let err = store.execute(&wrong).await.unwrap_err();
        assert!(matches!(err, StoreError::Query(msg) if msg.contains("Users")));
    }

    #[tokio::test]
    async fn invalid_statement_is_a_query_error() {
        let store = memory_store();
        let spec = QuerySpec::warehouse("broken", "SELEKT nothing");
        assert!(matches!(
            store.execute(&spec).await,
            Err(StoreError::Query(_))
        ));
    }

    #[tokio::test]
    async fn open_creates_parent_directories() {
        let dir = tempdir().expect("tempdir");
        let warehouse = dir.path().join("nested/warehouse.sqlite3");
        let operational = dir.path().join("nested/operational.sqlite3");
        let store = SqliteStore::open(&warehouse, &operational).expect("open");
        assert!(warehouse.exists());
        assert!(operational.exists());

        let rows = store
            .execute(&QuerySpec::warehouse("one", "SELECT 1 AS one"))
            .await
            .expect("query");
        assert_eq!(Value::Object(rows[0].clone()), json!({"one": 1}));
    }

    const ENDLESS: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                           SELECT count(*) AS n FROM c";

    fn file_store(dir: &Path) -> SqliteStore {
        let warehouse = dir.join("warehouse.sqlite3");
        let operational = dir.join("operational.sqlite3");
        let seed = Connection::open(&warehouse).unwrap();
        seed.execute_batch(
            "CREATE TABLE FactContentViews (ViewCount INTEGER);
             INSERT INTO FactContentViews VALUES (3), (4);",
        )
        .unwrap();
        drop(seed);
        SqliteStore::open(&warehouse, &operational).expect("open")
    }

    #[tokio::test]
    async fn long_query_does_not_hold_up_others_on_the_same_database() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(file_store(dir.path()));

        let busy = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .execute(&QuerySpec::warehouse("endless", ENDLESS))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let quick = QuerySpec::warehouse(
            "total",
            "SELECT SUM(ViewCount) AS total FROM FactContentViews",
        );
        let rows = tokio::time::timeout(Duration::from_secs(5), store.execute(&quick))
            .await
            .expect("not queued behind the endless query")
            .expect("query");
        assert_eq!(Value::Object(rows[0].clone()), json!({"total": 7}));

        // Dropping the waiting future interrupts the endless statement.
        busy.abort();
        assert!(busy.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn abandoned_query_is_interrupted() {
        let dir = tempdir().expect("tempdir");
        let store = file_store(dir.path());
        let spec = QuerySpec::warehouse("endless", ENDLESS);

        let timed_out = tokio::time::timeout(Duration::from_millis(200), store.execute(&spec)).await;
        assert!(timed_out.is_err());

        // A fresh statement still runs normally afterwards.
        let rows = store
            .execute(&QuerySpec::warehouse("one", "SELECT 1 AS one"))
            .await
            .expect("query");
        assert_eq!(Value::Object(rows[0].clone()), json!({"one": 1}));
    }

    #[tokio::test]
    async fn missing_database_file_is_unavailable() {
        let dir = tempdir().expect("tempdir");
        let store = file_store(dir.path());
        std::fs::remove_file(dir.path().join("operational.sqlite3")).unwrap();
        let _ = std::fs::remove_file(dir.path().join("operational.sqlite3-wal"));
        let _ = std::fs::remove_file(dir.path().join("operational.sqlite3-shm"));

        let err = store
            .execute(&QuerySpec::operational("users", "SELECT 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)), "{err:?}");
    }
}
