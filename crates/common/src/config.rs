use serde::{Deserialize, Serialize};

/// Czar-wide dispatch/merge configuration shared across pipeline layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CzarConfig {
    /// Target MySQL database holding merge/result/message tables.
    pub result_db: String,
    /// Unix socket path of the result MySQL server.
    pub result_socket: String,
    /// MySQL user for the result database.
    pub result_user: String,

    /// Max chunk jobs in flight for a single user query. `0` means no
    /// per-query bound beyond the global limit.
    pub max_in_flight_per_query: usize,
    /// Max chunk jobs in flight across all user queries.
    pub max_in_flight_global: usize,
    /// Max dispatch attempts per chunk job before the failure is permanent.
    pub max_attempts: u32,
    /// Per-job timeout; an expired job escalates to cancellation of that job.
    pub job_timeout_ms: u64,
    /// Base retry backoff in milliseconds (doubled per attempt).
    pub retry_backoff_base_ms: u64,

    /// Soft cap on a single merge row-batch payload.
    pub merge_buffer_bytes: usize,
    /// Chunk overlap in degrees used when a query has no table-level override.
    pub spatial_overlap_deg: f64,
}

impl Default for CzarConfig {
    fn default() -> Self {
        Self {
            result_db: "qresult".to_string(),
            result_socket: "/var/run/mysqld/mysqld.sock".to_string(),
            result_user: "qsmaster".to_string(),
            max_in_flight_per_query: 0,
            max_in_flight_global: 256,
            max_attempts: 3,
            job_timeout_ms: 600_000,
            retry_backoff_base_ms: 250,
            merge_buffer_bytes: 2 * 1024 * 1024,
            spatial_overlap_deg: 0.01667,
        }
    }
}

impl CzarConfig {
    /// Effective per-query in-flight bound given the global limit.
    pub fn per_query_limit(&self) -> usize {
        if self.max_in_flight_per_query == 0 {
            self.max_in_flight_global
        } else {
            self.max_in_flight_per_query.min(self.max_in_flight_global)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CzarConfig;

    #[test]
    fn per_query_limit_defaults_to_global() {
        let cfg = CzarConfig::default();
        assert_eq!(cfg.per_query_limit(), cfg.max_in_flight_global);

        let bounded = CzarConfig {
            max_in_flight_per_query: 8,
            ..CzarConfig::default()
        };
        assert_eq!(bounded.per_query_limit(), 8);
    }
}
