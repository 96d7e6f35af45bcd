//! Per-job frame stream validation.
//!
//! The validator enforces the wire contract frame by frame: identity match,
//! schema on the first frame, nothing after end-of-stream. Frames from a
//! different attempt of the same `(query, chunk)` are silently discarded so
//! a late completion of a superseded attempt can never contribute rows.

use skyq_common::{ChunkId, CzarError, QueryId, Result};
use tracing::debug;

use crate::frame::{decode_batch, decode_frame, RowBatch, RowSchema};

/// Validates one job attempt's frame sequence.
#[derive(Debug)]
pub struct FrameValidator {
    query_id: QueryId,
    chunk_id: ChunkId,
    attempt: u32,
    schema: Option<RowSchema>,
    accepted: u64,
    finished: bool,
}

impl FrameValidator {
    /// Build a validator for one `(query, chunk, attempt)` stream.
    pub fn new(query_id: QueryId, chunk_id: ChunkId, attempt: u32) -> Self {
        Self {
            query_id,
            chunk_id,
            attempt,
            schema: None,
            accepted: 0,
            finished: false,
        }
    }

    /// Validate one encoded frame.
    ///
    /// Returns the decoded batch, or `None` when the frame belongs to a
    /// stale attempt and is discarded.
    pub fn accept(&mut self, bytes: &[u8]) -> Result<Option<RowBatch>> {
        if self.finished {
            return Err(CzarError::ResultCorrupt(
                "frame received after end of stream".to_string(),
            ));
        }
        let (header, payload) = decode_frame(bytes)?;
        if header.query_id != self.query_id.0 || header.chunk_id != self.chunk_id.0 {
            return Err(CzarError::ResultCorrupt(format!(
                "frame for query {} chunk {} arrived on stream of query {} chunk {}",
                header.query_id, header.chunk_id, self.query_id, self.chunk_id
            )));
        }
        if header.attempt != self.attempt {
            debug!(
                query_id = %self.query_id,
                chunk_id = %self.chunk_id,
                frame_attempt = header.attempt,
                expected_attempt = self.attempt,
                "discarding frame from superseded attempt"
            );
            return Ok(None);
        }
        let batch = decode_batch(payload)?;
        if self.accepted == 0 {
            let Some(schema) = &batch.schema else {
                return Err(CzarError::ResultCorrupt(
                    "first frame carries no row schema".to_string(),
                ));
            };
            if schema.columns.is_empty() {
                return Err(CzarError::ResultCorrupt(
                    "first frame schema has no columns".to_string(),
                ));
            }
            self.schema = Some(schema.clone());
        }
        self.accepted += 1;
        if header.last {
            self.finished = true;
        }
        skyq_common::metrics::global_metrics().record_frame(
            &self.query_id.to_string(),
            self.chunk_id.0,
            payload.len() as u64,
        );
        Ok(Some(batch))
    }

    /// Schema seen on the first frame.
    pub fn schema(&self) -> Option<&RowSchema> {
        self.schema.as_ref()
    }

    /// Number of frames accepted from the expected attempt.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Whether the end-of-stream frame arrived.
    pub fn finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_batch_frame, ColumnSchema, RowBatch, RowSchema};

    fn schema() -> RowSchema {
        RowSchema {
            columns: vec![ColumnSchema {
                name: "c".to_string(),
                sql_type: "BIGINT".to_string(),
                nullable: false,
            }],
        }
    }

    fn first_batch() -> RowBatch {
        RowBatch {
            schema: Some(schema()),
            rows: vec![vec![Some("1".to_string())]],
        }
    }

    fn rows_only() -> RowBatch {
        RowBatch {
            schema: None,
            rows: vec![vec![Some("2".to_string())]],
        }
    }

    #[test]
    fn accepts_ordered_stream() {
        let mut v = FrameValidator::new(QueryId(9), ChunkId(4), 1);
        let f1 = encode_batch_frame(9, 4, 1, 0, false, &first_batch()).unwrap();
        let f2 = encode_batch_frame(9, 4, 1, 0, true, &rows_only()).unwrap();
        assert!(v.accept(&f1).unwrap().is_some());
        assert!(!v.finished());
        assert!(v.accept(&f2).unwrap().is_some());
        assert!(v.finished());
        assert_eq!(v.accepted(), 2);
        assert_eq!(v.schema().unwrap().columns[0].name, "c");
    }

    #[test]
    fn first_frame_without_schema_is_corrupt() {
        let mut v = FrameValidator::new(QueryId(9), ChunkId(4), 1);
        let f = encode_batch_frame(9, 4, 1, 0, false, &rows_only()).unwrap();
        assert!(matches!(v.accept(&f), Err(CzarError::ResultCorrupt(_))));
    }

    #[test]
    fn stale_attempt_frames_are_discarded() {
        let mut v = FrameValidator::new(QueryId(9), ChunkId(4), 2);
        let stale = encode_batch_frame(9, 4, 1, 0, true, &first_batch()).unwrap();
        assert!(v.accept(&stale).unwrap().is_none());
        assert_eq!(v.accepted(), 0);
        assert!(!v.finished());
    }

    #[test]
    fn wrong_job_identity_is_corrupt() {
        let mut v = FrameValidator::new(QueryId(9), ChunkId(4), 1);
        let f = encode_batch_frame(9, 5, 1, 0, false, &first_batch()).unwrap();
        assert!(matches!(v.accept(&f), Err(CzarError::ResultCorrupt(_))));
    }

    #[test]
    fn frames_after_last_are_corrupt() {
        let mut v = FrameValidator::new(QueryId(9), ChunkId(4), 1);
        let f1 = encode_batch_frame(9, 4, 1, 0, true, &first_batch()).unwrap();
        let f2 = encode_batch_frame(9, 4, 1, 0, true, &rows_only()).unwrap();
        v.accept(&f1).unwrap();
        assert!(matches!(v.accept(&f2), Err(CzarError::ResultCorrupt(_))));
    }
}
