use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("query '{0}' is already registered")]
    DuplicateName(String),
}

/// Which database a query reads from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryTarget {
    #[default]
    Warehouse,
    Operational,
}

impl fmt::Display for QueryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warehouse => write!(f, "warehouse"),
            Self::Operational => write!(f, "operational"),
        }
    }
}

/// A named aggregate. The statement is opaque to the engine; only the store
/// interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub name: String,
    pub target: QueryTarget,
    pub statement: String,
}

impl QuerySpec {
    pub fn new(name: impl Into<String>, target: QueryTarget, statement: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target,
            statement: statement.into(),
        }
    }

    pub fn warehouse(name: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::new(name, QueryTarget::Warehouse, statement)
    }

    pub fn operational(name: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::new(name, QueryTarget::Operational, statement)
    }
}

/// Fixed list of independent aggregate queries, kept in registration order.
#[derive(Debug, Clone, Default)]
pub struct QueryCatalog {
    specs: Vec<QuerySpec>,
    names: HashSet<String>,
}

impl QueryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: QuerySpec) -> Result<(), CatalogError> {
        if !self.names.insert(spec.name.clone()) {
            return Err(CatalogError::DuplicateName(spec.name));
        }
        self.specs.push(spec);
        Ok(())
    }

    pub fn with(mut self, spec: QuerySpec) -> Result<Self, CatalogError> {
        self.register(spec)?;
        Ok(self)
    }

    pub fn all(&self) -> &[QuerySpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&QuerySpec> {
        self.specs.iter().find(|spec| spec.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|spec| spec.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
