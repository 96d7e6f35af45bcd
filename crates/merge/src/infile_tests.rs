//! Merger contract tests over a recording backend.

use std::sync::{Arc, Mutex};

use skyq_common::{ChunkId, CzarError, MergeFatal, QueryId, Result};
use skyq_dispatch::{ColumnSchema, RowBatch, RowSchema};
use tonic::async_trait;

use crate::backend::MergeBackend;
use crate::infile::{FixupSpec, InfileMerger, InfileMergerConfig};

#[derive(Default)]
struct RecordingBackend {
    applied: Mutex<Vec<String>>,
    loads: Mutex<Vec<(String, String, usize)>>,
    fail_load_with: Mutex<Option<MergeFatal>>,
}

impl RecordingBackend {
    fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }

    fn load_count(&self) -> usize {
        self.loads.lock().unwrap().len()
    }

    fn create_count(&self) -> usize {
        self.applied()
            .iter()
            .filter(|s| s.starts_with("CREATE TABLE"))
            .count()
    }
}

#[async_trait]
impl MergeBackend for RecordingBackend {
    async fn apply(&self, sql: &str) -> Result<()> {
        self.applied.lock().unwrap().push(sql.to_string());
        Ok(())
    }

    async fn load_infile(&self, table: &str, virt_file: &str, data: Vec<u8>) -> Result<()> {
        if let Some(fatal) = self.fail_load_with.lock().unwrap().take() {
            return Err(fatal.into());
        }
        self.loads
            .lock()
            .unwrap()
            .push((table.to_string(), virt_file.to_string(), data.len()));
        Ok(())
    }
}

fn schema() -> RowSchema {
    RowSchema {
        columns: vec![ColumnSchema {
            name: "QS1_COUNT".to_string(),
            sql_type: "BIGINT".to_string(),
            nullable: false,
        }],
    }
}

fn batch_with_schema(value: &str) -> RowBatch {
    RowBatch {
        schema: Some(schema()),
        rows: vec![vec![Some(value.to_string())]],
    }
}

fn merger_with_fixup(backend: Arc<RecordingBackend>) -> InfileMerger {
    InfileMerger::new(
        InfileMergerConfig {
            query_id: QueryId(7),
            target_table: "result_7".to_string(),
            fixup: Some(FixupSpec {
                select: "SUM(QS1_COUNT) AS `COUNT(*)`".to_string(),
                post: String::new(),
                order_by_limit: String::new(),
            }),
            buffer_bytes: 1024 * 1024,
        },
        backend,
    )
}

#[tokio::test]
async fn create_table_is_issued_exactly_once_under_concurrency() {
    let backend = Arc::new(RecordingBackend::default());
    let merger = Arc::new(merger_with_fixup(Arc::clone(&backend)));

    let mut handles = Vec::new();
    for chunk in 0..8_u32 {
        let m = Arc::clone(&merger);
        handles.push(tokio::spawn(async move {
            m.merge_batch(ChunkId(chunk), 1, batch_with_schema("5")).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(backend.create_count(), 1);
    assert_eq!(backend.load_count(), 8);
    assert_eq!(merger.merge_table(), "result_7_m");
}

#[tokio::test]
async fn non_winning_attempt_batches_are_discarded() {
    let backend = Arc::new(RecordingBackend::default());
    let merger = merger_with_fixup(Arc::clone(&backend));

    merger
        .merge_batch(ChunkId(5), 1, batch_with_schema("1"))
        .await
        .unwrap();
    // A late retry of the same chunk must not contribute.
    merger
        .merge_batch(ChunkId(5), 2, batch_with_schema("2"))
        .await
        .unwrap();
    // More batches from the winning attempt still merge.
    merger
        .merge_batch(
            ChunkId(5),
            1,
            RowBatch {
                schema: None,
                rows: vec![vec![Some("3".to_string())]],
            },
        )
        .await
        .unwrap();

    assert_eq!(backend.load_count(), 2);
}

#[tokio::test]
async fn schema_mismatch_is_fatal_and_poisons() {
    let backend = Arc::new(RecordingBackend::default());
    let merger = merger_with_fixup(Arc::clone(&backend));

    merger
        .merge_batch(ChunkId(1), 1, batch_with_schema("1"))
        .await
        .unwrap();

    let mut other = batch_with_schema("2");
    other.schema.as_mut().unwrap().columns[0].sql_type = "DOUBLE".to_string();
    let err = merger.merge_batch(ChunkId(2), 1, other).await.unwrap_err();
    assert!(matches!(err, CzarError::ResultCorrupt(_)));

    // Poisoned: later batches are ignored without work.
    let loads_before = backend.load_count();
    merger
        .merge_batch(ChunkId(3), 1, batch_with_schema("4"))
        .await
        .unwrap();
    assert_eq!(backend.load_count(), loads_before);

    // finalize reports the recorded cause and drops the partial merge table.
    let err = merger.finalize().await.unwrap_err();
    assert!(matches!(
        err,
        CzarError::MergerFatal(MergeFatal::SchemaMismatch(_))
    ));
    assert!(backend
        .applied()
        .iter()
        .any(|s| s == "DROP TABLE IF EXISTS result_7_m"));
}

#[tokio::test]
async fn finalize_runs_fixup_and_drops_merge_table() {
    let backend = Arc::new(RecordingBackend::default());
    let merger = InfileMerger::new(
        InfileMergerConfig {
            query_id: QueryId(7),
            target_table: "result_7".to_string(),
            fixup: Some(FixupSpec {
                select: "SUM(QS1_COUNT) AS `COUNT(*)`".to_string(),
                post: "GROUP BY chunkId".to_string(),
                order_by_limit: "ORDER BY chunkId LIMIT 10".to_string(),
            }),
            buffer_bytes: 1024 * 1024,
        },
        Arc::clone(&backend) as Arc<dyn MergeBackend>,
    );

    merger
        .merge_batch(ChunkId(1), 1, batch_with_schema("5"))
        .await
        .unwrap();
    let table = merger.finalize().await.unwrap();
    assert_eq!(table, "result_7");

    let applied = backend.applied();
    assert!(applied.iter().any(|s| s
        == "CREATE TABLE IF NOT EXISTS result_7 \
            SELECT SUM(QS1_COUNT) AS `COUNT(*)` FROM result_7_m \
            GROUP BY chunkId ORDER BY chunkId LIMIT 10"));
    assert_eq!(applied.last().unwrap(), "DROP TABLE IF EXISTS result_7_m");
}

#[tokio::test]
async fn no_fixup_merges_straight_into_the_result_table() {
    let backend = Arc::new(RecordingBackend::default());
    let merger = InfileMerger::new(
        InfileMergerConfig {
            query_id: QueryId(8),
            target_table: "result_8".to_string(),
            fixup: None,
            buffer_bytes: 1024 * 1024,
        },
        Arc::clone(&backend) as Arc<dyn MergeBackend>,
    );
    assert_eq!(merger.merge_table(), "result_8");

    merger
        .merge_batch(ChunkId(1), 1, batch_with_schema("5"))
        .await
        .unwrap();
    let table = merger.finalize().await.unwrap();
    assert_eq!(table, "result_8");
    // Only the CREATE for the merge table itself; no fix-up, no drop.
    assert_eq!(backend.applied().len(), 1);
}

#[tokio::test]
async fn result_too_large_is_fatal() {
    let backend = Arc::new(RecordingBackend::default());
    *backend.fail_load_with.lock().unwrap() =
        Some(MergeFatal::ResultTooLarge("result_7_m".to_string()));
    let merger = merger_with_fixup(Arc::clone(&backend));

    let err = merger
        .merge_batch(ChunkId(1), 1, batch_with_schema("5"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CzarError::MergerFatal(MergeFatal::ResultTooLarge(_))
    ));
    let err = merger.finalize().await.unwrap_err();
    assert!(matches!(
        err,
        CzarError::MergerFatal(MergeFatal::ResultTooLarge(_))
    ));
}

#[tokio::test]
async fn rows_before_any_schema_are_corrupt() {
    let backend = Arc::new(RecordingBackend::default());
    let merger = merger_with_fixup(backend);
    let err = merger
        .merge_batch(
            ChunkId(1),
            1,
            RowBatch {
                schema: None,
                rows: vec![vec![Some("1".to_string())]],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CzarError::ResultCorrupt(_)));
}

#[tokio::test]
async fn finalize_without_any_results_is_an_error() {
    let backend = Arc::new(RecordingBackend::default());
    let merger = merger_with_fixup(backend);
    let err = merger.finalize().await.unwrap_err();
    assert!(matches!(
        err,
        CzarError::MergerFatal(MergeFatal::CreateTable(_))
    ));
}
