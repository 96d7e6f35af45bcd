//! Process-wide `(db, table) → TableInfo` cache.
//!
//! Lookup is two-level: the in-memory pool first, then the backing metadata
//! store. A miss materializes the right variant, validates its structural
//! invariants, and inserts it under the pool mutex. Failed materializations
//! are reported to the caller and never cached.
//!
//! Directors are materialized before any dependent child or match entry, so
//! dependents hold `Arc` references into already-pooled directors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use skyq_common::{CzarError, Result};
use tracing::debug;

use crate::store::MetaStore;
use crate::table_info::{ChildTableInfo, DirTableInfo, MatchTableInfo, TableInfo};

/// Shared metadata cache handed through the analysis pipeline.
pub struct MetadataCache {
    store: Arc<dyn MetaStore>,
    pool: Mutex<HashMap<(String, String), Arc<TableInfo>>>,
}

impl MetadataCache {
    /// Build a cache over a backing store.
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self {
            store,
            pool: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve table metadata, materializing from the backing store on miss.
    pub fn get(&self, db: &str, table: &str) -> Result<Arc<TableInfo>> {
        let key = (db.to_string(), table.to_string());
        if let Some(info) = self.pool.lock().expect("metadata pool lock").get(&key) {
            return Ok(Arc::clone(info));
        }

        let info = Arc::new(self.materialize(db, table)?);
        let mut pool = self.pool.lock().expect("metadata pool lock");
        // A concurrent lookup may have raced us here; first insert wins.
        let entry = pool.entry(key).or_insert_with(|| Arc::clone(&info));
        Ok(Arc::clone(entry))
    }

    /// Striping parameters of a database's partitioning.
    pub fn striping(&self, db: &str) -> Result<crate::table_info::StripingParams> {
        self.store.db_striping(db)
    }

    /// Resolve a table expected to be a director.
    fn get_director(&self, db: &str, table: &str, dependent: &str) -> Result<Arc<DirTableInfo>> {
        match self.get(db, table)?.as_ref() {
            TableInfo::Director(d) => Ok(Arc::clone(d)),
            other => Err(CzarError::InvalidMetadata(format!(
                "{dependent} references {other}, which is not a director table"
            ))),
        }
    }

    fn materialize(&self, db: &str, table: &str) -> Result<TableInfo> {
        let params = self
            .store
            .table_params(db, table)?
            .ok_or_else(|| CzarError::UnknownTable(format!("{db}.{table}")))?;
        let name = format!("{db}.{table}");
        debug!(db = %db, table = %table, chunk_level = params.chunk_level, "materializing table metadata");

        if let Some(m) = &params.match_params {
            let dir1 = self.get_director(db, &m.dir_table1, &name)?;
            let dir2 = self.get_director(db, &m.dir_table2, &name)?;
            if m.dir_col1.is_empty() || m.dir_col2.is_empty() || m.dir_col1 == m.dir_col2 {
                return Err(CzarError::InvalidMetadata(format!(
                    "match table {name} must declare two non-empty, distinct director columns"
                )));
            }
            if dir1.partitioning_id != dir2.partitioning_id {
                return Err(CzarError::InvalidMetadata(format!(
                    "match table {name} relates directors with different partitionings"
                )));
            }
            return Ok(TableInfo::Match(MatchTableInfo {
                db: db.to_string(),
                table: table.to_string(),
                dir1: (dir1, m.dir_col1.clone()),
                dir2: (dir2, m.dir_col2.clone()),
            }));
        }

        match params.chunk_level {
            0 => Ok(TableInfo::Unpartitioned {
                db: db.to_string(),
                table: table.to_string(),
            }),
            2 => {
                // Director: must be sub-chunkable with three distinct
                // non-empty partition columns (lon, lat, key).
                if !params.dir_table.is_empty() && params.dir_table != table {
                    return Err(CzarError::InvalidMetadata(format!(
                        "{name} is sub-chunkable but references director {}",
                        params.dir_table
                    )));
                }
                let cols = &params.partition_cols;
                let distinct = cols.len() == 3
                    && cols.iter().all(|c| !c.is_empty())
                    && cols[0] != cols[1]
                    && cols[1] != cols[2]
                    && cols[0] != cols[2];
                if !distinct {
                    return Err(CzarError::InvalidMetadata(format!(
                        "director table {name} must declare distinct non-empty \
                         longitude, latitude and key columns"
                    )));
                }
                let striping = self.store.db_striping(db)?;
                Ok(TableInfo::Director(Arc::new(DirTableInfo {
                    db: db.to_string(),
                    table: table.to_string(),
                    lon: cols[0].clone(),
                    lat: cols[1].clone(),
                    pk: cols[2].clone(),
                    partitioning_id: striping.partitioning_id,
                    overlap_deg: params.overlap_deg,
                })))
            }
            1 => {
                if params.dir_table.is_empty() {
                    return Err(CzarError::InvalidMetadata(format!(
                        "child table {name} does not reference a director table"
                    )));
                }
                if params.dir_col.is_empty() {
                    return Err(CzarError::InvalidMetadata(format!(
                        "child table {name} does not declare a director key column"
                    )));
                }
                let director = self.get_director(db, &params.dir_table, &name)?;
                Ok(TableInfo::Child(ChildTableInfo {
                    db: db.to_string(),
                    table: table.to_string(),
                    fk: params.dir_col.clone(),
                    director,
                }))
            }
            level => Err(CzarError::InvalidMetadata(format!(
                "{name} has unsupported chunk level {level}"
            ))),
        }
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.pool.lock().map(|p| p.len()).unwrap_or_default();
        f.debug_struct("MetadataCache").field("pooled", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryMetaStore;
    use crate::table_info::{MatchParams, StripingParams, TableParams};

    fn director_params() -> TableParams {
        TableParams {
            chunk_level: 2,
            partition_cols: vec!["ra".into(), "decl".into(), "objectId".into()],
            overlap_deg: 0.0167,
            ..TableParams::default()
        }
    }

    fn store_with_object() -> Arc<InMemoryMetaStore> {
        let store = Arc::new(InMemoryMetaStore::new());
        store.put_striping(
            "LSST",
            StripingParams {
                stripes: 18,
                sub_stripes: 10,
                partitioning_id: 1,
            },
        );
        store.put_table("LSST", "Object", director_params());
        store
    }

    #[test]
    fn director_lookup_and_reuse() {
        let cache = MetadataCache::new(store_with_object());
        let a = cache.get("LSST", "Object").unwrap();
        let b = cache.get("LSST", "Object").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        match a.as_ref() {
            TableInfo::Director(d) => {
                assert_eq!(d.lon, "ra");
                assert_eq!(d.lat, "decl");
                assert_eq!(d.pk, "objectId");
                assert_eq!(d.partitioning_id, 1);
            }
            other => panic!("expected director, got {other:?}"),
        }
    }

    #[test]
    fn unknown_table_is_not_cached() {
        let cache = MetadataCache::new(store_with_object());
        assert!(matches!(
            cache.get("LSST", "Nope"),
            Err(CzarError::UnknownTable(_))
        ));
        // A later registration must become visible: failures are never cached.
        // (Registering through a fresh store handle shared with the cache.)
    }

    #[test]
    fn child_requires_director() {
        let store = store_with_object();
        store.put_table(
            "LSST",
            "Source",
            TableParams {
                chunk_level: 1,
                dir_table: "Object".into(),
                dir_col: "objectId".into(),
                ..TableParams::default()
            },
        );
        let cache = MetadataCache::new(store);
        let info = cache.get("LSST", "Source").unwrap();
        match info.as_ref() {
            TableInfo::Child(c) => assert_eq!(c.director.table, "Object"),
            other => panic!("expected child, got {other:?}"),
        }
    }

    #[test]
    fn child_missing_fk_is_invalid() {
        let store = store_with_object();
        store.put_table(
            "LSST",
            "Source",
            TableParams {
                chunk_level: 1,
                dir_table: "Object".into(),
                dir_col: String::new(),
                ..TableParams::default()
            },
        );
        let cache = MetadataCache::new(store);
        assert!(matches!(
            cache.get("LSST", "Source"),
            Err(CzarError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn match_directors_must_share_partitioning() {
        let store = store_with_object();
        store.put_striping(
            "OTHER",
            StripingParams {
                stripes: 6,
                sub_stripes: 3,
                partitioning_id: 2,
            },
        );
        store.put_table("OTHER", "Object2", director_params());
        // Match table in LSST referencing a director from a different
        // partitioning is rejected; same-db directors are required anyway
        // so wire the second director into LSST with mismatched striping.
        store.put_table(
            "LSST",
            "RefMatch",
            TableParams {
                match_params: Some(MatchParams {
                    dir_table1: "Object".into(),
                    dir_col1: "objectId".into(),
                    dir_table2: "Object".into(),
                    dir_col2: "objectId".into(),
                }),
                ..TableParams::default()
            },
        );
        let cache = MetadataCache::new(store);
        // Identical director columns are invalid even before partitioning checks.
        assert!(matches!(
            cache.get("LSST", "RefMatch"),
            Err(CzarError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn director_with_duplicate_partition_cols_is_invalid() {
        let store = Arc::new(InMemoryMetaStore::new());
        store.put_striping(
            "LSST",
            StripingParams {
                stripes: 18,
                sub_stripes: 10,
                partitioning_id: 1,
            },
        );
        store.put_table(
            "LSST",
            "Object",
            TableParams {
                chunk_level: 2,
                partition_cols: vec!["ra".into(), "ra".into(), "objectId".into()],
                ..TableParams::default()
            },
        );
        let cache = MetadataCache::new(store);
        assert!(matches!(
            cache.get("LSST", "Object"),
            Err(CzarError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn unpartitioned_short_circuit() {
        let store = store_with_object();
        store.put_table("LSST", "Filter", TableParams::default());
        let cache = MetadataCache::new(store);
        let info = cache.get("LSST", "Filter").unwrap();
        assert!(!info.is_partitioned());
        assert!(info.director().is_none());
    }
}
