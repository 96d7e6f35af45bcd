//! End-to-end controller tests over an in-memory transport and a recording
//! result-database backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::async_trait;

use skyq_common::{ChunkId, CzarConfig, QueryId, Result};
use skyq_dispatch::frame::encode_batch_frame;
use skyq_dispatch::{
    ChunkRequest, ChunkTransport, ColumnSchema, FrameStream, RowBatch, RowSchema,
};
use skyq_merge::MergeBackend;
use skyq_metadata::{InMemoryMetaStore, MetadataCache, StripingParams, TableParams};

use crate::controller::Czar;

/// Serves one COUNT row per chunk; optionally hangs every stream instead.
#[derive(Default)]
struct FleetTransport {
    counts: Mutex<HashMap<u32, u64>>,
    hang_all: bool,
    open_hangs: Mutex<Vec<mpsc::Sender<Result<Vec<u8>>>>>,
    cancels: Mutex<Vec<u32>>,
}

impl FleetTransport {
    fn with_counts(counts: &[(u32, u64)]) -> Self {
        Self {
            counts: Mutex::new(counts.iter().copied().collect()),
            ..Self::default()
        }
    }

    fn hanging() -> Self {
        Self {
            hang_all: true,
            ..Self::default()
        }
    }
}

fn count_schema() -> RowSchema {
    RowSchema {
        columns: vec![ColumnSchema {
            name: "QS1_COUNT".to_string(),
            sql_type: "BIGINT".to_string(),
            nullable: false,
        }],
    }
}

#[async_trait]
impl ChunkTransport for FleetTransport {
    async fn execute(&self, request: ChunkRequest) -> Result<FrameStream> {
        if self.hang_all {
            let (tx, rx) = mpsc::channel(1);
            self.open_hangs.lock().unwrap().push(tx);
            return Ok(Box::pin(ReceiverStream::new(rx)));
        }
        let count = self
            .counts
            .lock()
            .unwrap()
            .get(&request.chunk_id.0)
            .copied()
            .unwrap_or(0);
        let batch = RowBatch {
            schema: Some(count_schema()),
            rows: vec![vec![Some(count.to_string())]],
        };
        let frame = encode_batch_frame(
            request.query_id.0,
            request.chunk_id.0,
            request.attempt,
            request.session.0,
            true,
            &batch,
        )?;
        Ok(Box::pin(futures::stream::iter(vec![Ok(frame)])))
    }

    async fn cancel(&self, _query_id: QueryId, chunk_id: ChunkId) -> Result<()> {
        self.cancels.lock().unwrap().push(chunk_id.0);
        self.open_hangs.lock().unwrap().clear();
        Ok(())
    }
}

#[derive(Default)]
struct RecordingBackend {
    applied: Mutex<Vec<String>>,
    loads: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingBackend {
    fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl MergeBackend for RecordingBackend {
    async fn apply(&self, sql: &str) -> Result<()> {
        self.applied.lock().unwrap().push(sql.to_string());
        Ok(())
    }

    async fn load_infile(&self, table: &str, _virt_file: &str, data: Vec<u8>) -> Result<()> {
        self.loads
            .lock()
            .unwrap()
            .push((table.to_string(), data));
        Ok(())
    }
}

/// Two-chunk grid: one stripe, two chunks (ids 0 and 1).
fn metadata() -> Arc<MetadataCache> {
    let store = Arc::new(InMemoryMetaStore::new());
    store.put_striping(
        "LSST",
        StripingParams {
            stripes: 1,
            sub_stripes: 4,
            partitioning_id: 1,
        },
    );
    store.put_table(
        "LSST",
        "Object",
        TableParams {
            chunk_level: 2,
            partition_cols: vec!["ra".into(), "decl".into(), "objectId".into()],
            overlap_deg: 0.0167,
            ..TableParams::default()
        },
    );
    Arc::new(MetadataCache::new(store))
}

fn test_config() -> CzarConfig {
    CzarConfig {
        max_attempts: 2,
        job_timeout_ms: 400,
        retry_backoff_base_ms: 5,
        ..CzarConfig::default()
    }
}

fn hints() -> HashMap<String, String> {
    HashMap::from([("db".to_string(), "LSST".to_string())])
}

async fn wait_done(czar: &Arc<Czar>, id: QueryId) {
    for _ in 0..300 {
        if czar.query_state(id).is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("query {id} did not reach a terminal state");
}

#[tokio::test]
async fn count_over_two_chunks_merges_and_fixes_up() {
    let transport = Arc::new(FleetTransport::with_counts(&[(0, 10), (1, 32)]));
    let backend = Arc::new(RecordingBackend::default());
    let czar = Czar::new(
        test_config(),
        metadata(),
        Arc::clone(&transport) as Arc<dyn ChunkTransport>,
        Arc::clone(&backend) as Arc<dyn MergeBackend>,
    );

    let result = czar.submit_query("SELECT COUNT(*) FROM Object", &hints()).await;
    assert!(result.error_msg.is_empty(), "{}", result.error_msg);
    assert_eq!(result.result_table, "result_1");
    assert_eq!(result.message_table, "message_1");
    assert!(result.order_by.is_empty());

    wait_done(&czar, QueryId(1)).await;
    let applied = backend.applied();

    // Message table created and locked before any merge work.
    assert!(applied[0].starts_with("CREATE TABLE IF NOT EXISTS message_1"));
    assert_eq!(applied[1], "LOCK TABLES message_1 WRITE");
    // Exactly one merge-table create despite two concurrent chunks.
    assert_eq!(
        applied
            .iter()
            .filter(|s| s.starts_with("CREATE TABLE IF NOT EXISTS result_1_m"))
            .count(),
        1
    );
    // One contribution per chunk, carrying that chunk's partial count.
    let loads = backend.loads.lock().unwrap().clone();
    assert_eq!(loads.len(), 2);
    let merged: Vec<String> = loads
        .iter()
        .map(|(_, data)| String::from_utf8(data.clone()).unwrap())
        .collect();
    assert!(merged.contains(&"10\n".to_string()));
    assert!(merged.contains(&"32\n".to_string()));
    // Fix-up re-reduces the per-chunk counts and drops the merge table.
    assert!(applied.iter().any(|s| s.starts_with(
        "CREATE TABLE IF NOT EXISTS result_1 SELECT SUM(QS1_COUNT) AS `COUNT(*)` FROM result_1_m"
    )));
    assert!(applied.iter().any(|s| s == "DROP TABLE IF EXISTS result_1_m"));
    // Completion message written, then the lock released.
    assert!(applied
        .iter()
        .any(|s| s.starts_with("INSERT INTO message_1") && s.contains("COMPLETE")));
    assert_eq!(applied.last().unwrap(), "UNLOCK TABLES");
}

#[tokio::test]
async fn kill_mid_flight_cancels_and_drops_merge_table() {
    let transport = Arc::new(FleetTransport::hanging());
    let backend = Arc::new(RecordingBackend::default());
    let czar = Czar::new(
        test_config(),
        metadata(),
        Arc::clone(&transport) as Arc<dyn ChunkTransport>,
        Arc::clone(&backend) as Arc<dyn MergeBackend>,
    );

    let result = czar.submit_query("SELECT COUNT(*) FROM Object", &hints()).await;
    assert!(result.error_msg.is_empty());

    tokio::time::sleep(Duration::from_millis(30)).await;
    czar.kill_query("KILL QUERY 1", "").await.unwrap();
    wait_done(&czar, QueryId(1)).await;

    let applied = backend.applied();
    // No rows merged, no fix-up ran; the merge table is dropped.
    assert!(backend.loads.lock().unwrap().is_empty());
    assert!(applied.iter().any(|s| s == "DROP TABLE IF EXISTS result_1_m"));
    assert!(!applied
        .iter()
        .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS result_1 ")));
    // One CANCELLED row for the client.
    assert_eq!(
        applied
            .iter()
            .filter(|s| s.starts_with("INSERT INTO message_1") && s.contains("CANCELLED"))
            .count(),
        1
    );
    assert_eq!(applied.last().unwrap(), "UNLOCK TABLES");
}

#[tokio::test]
async fn unknown_table_is_rejected_synchronously() {
    let transport = Arc::new(FleetTransport::default());
    let backend = Arc::new(RecordingBackend::default());
    let czar = Czar::new(
        test_config(),
        metadata(),
        transport as Arc<dyn ChunkTransport>,
        Arc::clone(&backend) as Arc<dyn MergeBackend>,
    );

    let result = czar.submit_query("SELECT x FROM Missing", &hints()).await;
    assert!(result.error_msg.contains("unknown table"));
    // Rejected before any result-database work.
    assert!(backend.applied().is_empty());
}

#[tokio::test]
async fn kill_of_unknown_query_is_an_error() {
    let transport = Arc::new(FleetTransport::default());
    let backend = Arc::new(RecordingBackend::default());
    let czar = Czar::new(
        test_config(),
        metadata(),
        transport as Arc<dyn ChunkTransport>,
        backend as Arc<dyn MergeBackend>,
    );
    assert!(czar.kill_query("KILL 99", "").await.is_err());
}

#[tokio::test]
async fn order_by_is_reported_to_the_shim() {
    let transport = Arc::new(FleetTransport::with_counts(&[(0, 1), (1, 2)]));
    let backend = Arc::new(RecordingBackend::default());
    let czar = Czar::new(
        test_config(),
        metadata(),
        transport as Arc<dyn ChunkTransport>,
        backend as Arc<dyn MergeBackend>,
    );
    let result = czar
        .submit_query("SELECT ra FROM Object ORDER BY ra LIMIT 5", &hints())
        .await;
    assert!(result.error_msg.is_empty());
    assert_eq!(result.order_by, "ORDER BY ra");
    wait_done(&czar, QueryId(1)).await;
}
