//! Partitioning metadata for catalog tables.
//!
//! Variants mirror the catalog's partitioning kinds:
//! - director: spatially partitioned on its own (lon, lat, key) columns,
//!   sub-chunkable (chunk level 2);
//! - child: partitioned by a foreign key into a director (chunk level 1);
//! - match: a bridge between two directors sharing one partitioning;
//! - unpartitioned: replicated to every worker, broadcast into sub-jobs.
//!
//! Directors are shared by `Arc` so child/match entries hold non-owning
//! references into the pool without cycles.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Director-table metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DirTableInfo {
    /// Database the table belongs to.
    pub db: String,
    /// Table name.
    pub table: String,
    /// Primary spatial key column.
    pub pk: String,
    /// Longitude column.
    pub lon: String,
    /// Latitude column.
    pub lat: String,
    /// Identifier of the partitioning this director belongs to.
    pub partitioning_id: u32,
    /// Overlap radius in degrees replicated from neighboring chunks.
    pub overlap_deg: f64,
}

/// Child-table metadata: partitioned via a foreign key into a director.
#[derive(Debug, Clone)]
pub struct ChildTableInfo {
    /// Database the table belongs to.
    pub db: String,
    /// Table name.
    pub table: String,
    /// Foreign-key column referencing the director's primary key.
    pub fk: String,
    /// The director this table is partitioned against.
    pub director: Arc<DirTableInfo>,
}

/// Match-table metadata: relates rows of two director tables.
#[derive(Debug, Clone)]
pub struct MatchTableInfo {
    /// Database the table belongs to.
    pub db: String,
    /// Table name.
    pub table: String,
    /// First director and the match column referencing it.
    pub dir1: (Arc<DirTableInfo>, String),
    /// Second director and the match column referencing it.
    pub dir2: (Arc<DirTableInfo>, String),
}

/// Metadata for a table visible to the rewriter.
#[derive(Debug, Clone)]
pub enum TableInfo {
    /// Spatially partitioned director table.
    Director(Arc<DirTableInfo>),
    /// Table partitioned through a director foreign key.
    Child(ChildTableInfo),
    /// Bridge between two director tables.
    Match(MatchTableInfo),
    /// Replicated, unpartitioned table.
    Unpartitioned {
        /// Database the table belongs to.
        db: String,
        /// Table name.
        table: String,
    },
}

impl TableInfo {
    /// Database of the underlying table.
    pub fn db(&self) -> &str {
        match self {
            TableInfo::Director(d) => &d.db,
            TableInfo::Child(c) => &c.db,
            TableInfo::Match(m) => &m.db,
            TableInfo::Unpartitioned { db, .. } => db,
        }
    }

    /// Name of the underlying table.
    pub fn table(&self) -> &str {
        match self {
            TableInfo::Director(d) => &d.table,
            TableInfo::Child(c) => &c.table,
            TableInfo::Match(m) => &m.table,
            TableInfo::Unpartitioned { table, .. } => table,
        }
    }

    /// Whether per-chunk sub-queries must be generated for this table.
    pub fn is_partitioned(&self) -> bool {
        !matches!(self, TableInfo::Unpartitioned { .. })
    }

    /// Director governing this table's spatial placement, if any.
    ///
    /// Match tables return their first director; both share a partitioning.
    pub fn director(&self) -> Option<&Arc<DirTableInfo>> {
        match self {
            TableInfo::Director(d) => Some(d),
            TableInfo::Child(c) => Some(&c.director),
            TableInfo::Match(m) => Some(&m.dir1.0),
            TableInfo::Unpartitioned { .. } => None,
        }
    }

    /// Whether this table supports sub-chunked execution.
    pub fn supports_sub_chunks(&self) -> bool {
        matches!(self, TableInfo::Director(_))
    }
}

impl fmt::Display for TableInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db(), self.table())
    }
}

/// Raw partitioning parameters as stored in the backing metadata store.
///
/// `chunk_level` encodes the kind: 0 unpartitioned, 1 child, 2 director
/// (sub-chunkable). Match tables carry the two director references instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableParams {
    /// 0 = unpartitioned, 1 = chunked only, 2 = chunked + sub-chunked.
    pub chunk_level: u8,
    /// Director table this table is partitioned against (children only;
    /// empty or self-referencing for directors).
    pub dir_table: String,
    /// Foreign-key column into the director (children only).
    pub dir_col: String,
    /// Partition columns `(lon, lat, key)` for directors.
    pub partition_cols: Vec<String>,
    /// Overlap radius in degrees.
    pub overlap_deg: f64,
    /// Match-table parameters, when this is a match table.
    pub match_params: Option<MatchParams>,
}

/// Match-table parameters from the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchParams {
    /// First director table name.
    pub dir_table1: String,
    /// Match column referencing the first director.
    pub dir_col1: String,
    /// Second director table name.
    pub dir_table2: String,
    /// Match column referencing the second director.
    pub dir_col2: String,
}

/// Per-database striping parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StripingParams {
    /// Number of latitude stripes over the sphere.
    pub stripes: u32,
    /// Sub-stripes per stripe.
    pub sub_stripes: u32,
    /// Identifier shared by every table of this partitioning.
    pub partitioning_id: u32,
}
