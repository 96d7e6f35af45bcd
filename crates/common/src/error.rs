use thiserror::Error;

/// Canonical czar error taxonomy used across crates.
///
/// Classification guidance:
/// - [`CzarError::Unsupported`]: syntactically valid SQL outside the supported subset
/// - [`CzarError::UnknownTable`] / [`CzarError::InvalidMetadata`]: catalog lookup failures
/// - [`CzarError::TransientTransport`]: retryable worker/transport faults
/// - [`CzarError::WorkerFailure`]: permanent worker-side failure after retries
/// - [`CzarError::ResultCorrupt`]: frame size/md5/schema violations (never retried)
/// - [`CzarError::MergerFatal`]: result-database failures that poison the merge
/// - [`CzarError::Cancelled`]: cooperative cancellation, never surfaced as failure
/// - [`CzarError::InvalidConfig`]: configuration/environment contract violations
/// - [`CzarError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum CzarError {
    /// Valid SQL shape that the rewriter intentionally does not support.
    ///
    /// Examples:
    /// - correlated subqueries over partitioned tables
    /// - `SELECT DISTINCT` combined with a non-decomposable aggregate
    #[error("unsupported query: {0}")]
    Unsupported(String),

    /// The referenced table is not present in the catalog metadata store.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Catalog metadata exists but violates a structural invariant.
    ///
    /// Examples:
    /// - match table whose directors use different partitionings
    /// - director table without three distinct partition columns
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Retryable transport fault (connection loss, worker restart, timeout).
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    /// Permanent worker-side failure; fails the whole user query.
    #[error("worker failure: {0}")]
    WorkerFailure(String),

    /// Result stream corruption: size prefix, md5, or schema mismatch.
    #[error("corrupt result stream: {0}")]
    ResultCorrupt(String),

    /// Fatal merger condition; the partial merge table is dropped on cleanup.
    #[error("merger fatal: {0}")]
    MergerFatal(#[from] MergeFatal),

    /// Cooperative cancellation. Terminal state, not a failure.
    #[error("query cancelled")]
    Cancelled,

    /// Invalid or inconsistent configuration/environment state.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal merger sub-conditions tracked separately so callers can report the
/// first observed cause precisely.
#[derive(Debug, Clone, Error)]
pub enum MergeFatal {
    /// `CREATE TABLE` for the merge table failed.
    #[error("create table failed: {0}")]
    CreateTable(String),

    /// A `LOAD DATA LOCAL INFILE` statement failed.
    #[error("load data infile failed: {0}")]
    LoadInfile(String),

    /// Connection to the result database was lost.
    #[error("result database connection lost: {0}")]
    ConnectionLost(String),

    /// The merge table hit the MySQL "table is full" limit (error 1114).
    #[error("result too large for merge table {0}")]
    ResultTooLarge(String),

    /// First-frame schema disagrees with the schema already merged.
    #[error("result schema mismatch: {0}")]
    SchemaMismatch(String),
}

impl CzarError {
    /// Whether the dispatcher may retry the failed chunk job.
    pub fn is_transient(&self) -> bool {
        matches!(self, CzarError::TransientTransport(_))
    }

    /// Whether this terminates the user query without counting as failure.
    pub fn is_cancel(&self) -> bool {
        matches!(self, CzarError::Cancelled)
    }
}

/// Standard czar result alias.
pub type Result<T> = std::result::Result<T, CzarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(CzarError::TransientTransport("worker reset".into()).is_transient());
        assert!(!CzarError::WorkerFailure("syntax error".into()).is_transient());
        assert!(!CzarError::ResultCorrupt("md5".into()).is_transient());
    }

    #[test]
    fn merge_fatal_converts() {
        let e: CzarError = MergeFatal::ResultTooLarge("result_55_m".into()).into();
        assert!(matches!(
            e,
            CzarError::MergerFatal(MergeFatal::ResultTooLarge(_))
        ));
        assert!(!e.is_transient());
    }
}
