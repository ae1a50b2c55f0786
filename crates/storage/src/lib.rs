use futures_util::future::BoxFuture;
use thiserror::Error;

use pulseboard_core::{QuerySpec, Row};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("no such query: {0}")]
    UnknownQuery(String),
}

/// Executes named aggregate queries and returns their rows.
///
/// Implementations must be safe to call concurrently; the engine issues every
/// catalog query at once during a refresh.
pub trait Store: Send + Sync {
    fn execute<'a>(&'a self, spec: &'a QuerySpec) -> BoxFuture<'a, Result<Vec<Row>, StoreError>>;
}

pub mod memory;
pub mod sqlite3;

pub use memory::MemoryStore;
pub use sqlite3::SqliteStore;
