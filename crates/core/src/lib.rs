pub mod catalog;
pub mod snapshot;

pub use catalog::{CatalogError, QueryCatalog, QuerySpec, QueryTarget};
pub use snapshot::{Row, Snapshot, SnapshotBus};
