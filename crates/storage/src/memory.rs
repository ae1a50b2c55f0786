//! In-process store with scripted per-query behavior.
//!
//! Every query name maps to a [`Script`]: fixed rows, a failure, or an
//! unavailable backend, optionally delayed. Scripts can be swapped while the
//! engine is running, which is how tests drive a refresh into failure and back.

use crate::{Store, StoreError};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use pulseboard_core::{QuerySpec, Row};

#[derive(Debug, Clone)]
pub enum Outcome {
    Rows(Vec<Row>),
    Fail(String),
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct Script {
    pub outcome: Outcome,
    pub latency: Option<Duration>,
}

impl Script {
    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            outcome: Outcome::Rows(rows),
            latency: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Fail(message.into()),
            latency: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Unavailable(message.into()),
            latency: None,
        }
    }

    pub fn after(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[derive(Default)]
pub struct MemoryStore {
    scripts: Mutex<HashMap<String, Script>>,
    executions: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<String>, script: Script) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), script);
    }

    pub fn set_rows(&self, name: impl Into<String>, rows: Vec<Row>) {
        self.set(name, Script::rows(rows));
    }

    /// Total number of `execute` calls served so far.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }
}

impl Store for MemoryStore {
    fn execute<'a>(&'a self, spec: &'a QuerySpec) -> BoxFuture<'a, Result<Vec<Row>, StoreError>> {
        Box::pin(async move {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&spec.name)
                .cloned()
                .ok_or_else(|| StoreError::UnknownQuery(spec.name.clone()))?;
            if let Some(latency) = script.latency {
                tokio::time::sleep(latency).await;
            }
            match script.outcome {
                Outcome::Rows(rows) => Ok(rows),
                Outcome::Fail(message) => Err(StoreError::Query(message)),
                Outcome::Unavailable(message) => Err(StoreError::Unavailable(message)),
            }
        })
    }
}
