//! Backing key/value metadata store interface.
//!
//! The czar reads partitioning metadata from an external store (ZooKeeper- or
//! MySQL-backed). Only the lookup contract is defined here; deployments plug
//! in their own implementation. [`InMemoryMetaStore`] backs tests and
//! single-process setups.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde::Deserialize;
use skyq_common::{CzarError, Result};

use crate::table_info::{StripingParams, TableParams};

/// Read-only view of the partitioning metadata store.
pub trait MetaStore: Send + Sync {
    /// Returns whether the database is registered at all.
    fn has_db(&self, db: &str) -> Result<bool>;

    /// Raw table parameters, or `None` when the table is not registered.
    fn table_params(&self, db: &str, table: &str) -> Result<Option<TableParams>>;

    /// Striping parameters of the database's partitioning.
    fn db_striping(&self, db: &str) -> Result<StripingParams>;
}

/// Map-backed store for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryMetaStore {
    tables: Mutex<HashMap<(String, String), TableParams>>,
    striping: Mutex<HashMap<String, StripingParams>>,
}

#[derive(Debug, Deserialize)]
struct CatalogFileDb {
    striping: StripingParams,
    #[serde(default)]
    tables: HashMap<String, TableParams>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    databases: HashMap<String, CatalogFileDb>,
}

impl InMemoryMetaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON catalog file describing striping and table parameters.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let file: CatalogFile = serde_json::from_slice(&bytes).map_err(|e| {
            CzarError::InvalidConfig(format!(
                "catalog file {} is invalid: {e}",
                path.as_ref().display()
            ))
        })?;
        let store = Self::new();
        for (db, entry) in file.databases {
            store.put_striping(&db, entry.striping);
            for (table, params) in entry.tables {
                store.put_table(&db, &table, params);
            }
        }
        Ok(store)
    }

    /// Register a database's striping parameters.
    pub fn put_striping(&self, db: &str, striping: StripingParams) {
        self.striping
            .lock()
            .expect("striping lock")
            .insert(db.to_string(), striping);
    }

    /// Register a table's raw partitioning parameters.
    pub fn put_table(&self, db: &str, table: &str, params: TableParams) {
        self.tables
            .lock()
            .expect("tables lock")
            .insert((db.to_string(), table.to_string()), params);
    }
}

impl MetaStore for InMemoryMetaStore {
    fn has_db(&self, db: &str) -> Result<bool> {
        Ok(self.striping.lock().expect("striping lock").contains_key(db))
    }

    fn table_params(&self, db: &str, table: &str) -> Result<Option<TableParams>> {
        Ok(self
            .tables
            .lock()
            .expect("tables lock")
            .get(&(db.to_string(), table.to_string()))
            .cloned())
    }

    fn db_striping(&self, db: &str) -> Result<StripingParams> {
        self.striping
            .lock()
            .expect("striping lock")
            .get(db)
            .copied()
            .ok_or_else(|| {
                skyq_common::CzarError::InvalidMetadata(format!(
                    "database '{db}' has no striping parameters"
                ))
            })
    }
}
