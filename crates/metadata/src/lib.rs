//! Catalog partitioning metadata: table kinds, the backing store seam, and
//! the process-wide cache.
//!
//! Architecture role:
//! - materializes [`TableInfo`] variants from raw store parameters
//! - validates structural invariants before an entry becomes visible
//! - shares long-lived entries by read-only `Arc` reference
//!
//! Key modules:
//! - [`table_info`]
//! - [`store`]
//! - [`cache`]

pub mod cache;
pub mod store;
pub mod table_info;

pub use cache::MetadataCache;
pub use store::{InMemoryMetaStore, MetaStore};
pub use table_info::{
    ChildTableInfo, DirTableInfo, MatchParams, MatchTableInfo, StripingParams, TableInfo,
    TableParams,
};
