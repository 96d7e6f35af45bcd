//! Executive lifecycle tests over a scripted in-memory transport.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tonic::async_trait;

use skyq_common::{ChunkId, CzarError, QueryId, Result, SessionId};

use crate::executive::{DispatchConfig, Executive, JobInput, MergeSink, QueryOutcome};
use crate::frame::{encode_batch_frame, ColumnSchema, RowBatch, RowSchema};
use crate::job::JobState;
use crate::transport::{ChunkRequest, ChunkTransport, FrameStream};

#[derive(Clone)]
enum Script {
    /// Serve these encoded frames then end the stream.
    Frames(Vec<Vec<u8>>),
    /// Fail dispatch with a transient transport error.
    Transient,
    /// Keep the stream open without ever producing a frame.
    Hang,
}

#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<HashMap<u32, VecDeque<Script>>>,
    cancels: Mutex<Vec<(u64, u32)>>,
    open_hangs: Mutex<Vec<mpsc::Sender<Result<Vec<u8>>>>>,
}

impl ScriptedTransport {
    fn script(&self, chunk: u32, steps: Vec<Script>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(chunk, steps.into_iter().collect());
    }

    fn cancelled(&self) -> Vec<(u64, u32)> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkTransport for ScriptedTransport {
    async fn execute(&self, request: ChunkRequest) -> Result<FrameStream> {
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.chunk_id.0)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| {
                Script::Frames(ok_frames(
                    request.query_id.0,
                    request.chunk_id.0,
                    request.attempt,
                ))
            });
        match step {
            Script::Frames(frames) => Ok(Box::pin(futures::stream::iter(
                frames.into_iter().map(Ok),
            ))),
            Script::Transient => Err(CzarError::TransientTransport(format!(
                "connection to worker of chunk {} lost",
                request.chunk_id
            ))),
            Script::Hang => {
                let (tx, rx) = mpsc::channel(1);
                self.open_hangs.lock().unwrap().push(tx);
                Ok(Box::pin(ReceiverStream::new(rx)))
            }
        }
    }

    async fn cancel(&self, query_id: QueryId, chunk_id: ChunkId) -> Result<()> {
        self.cancels.lock().unwrap().push((query_id.0, chunk_id.0));
        self.open_hangs.lock().unwrap().clear();
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    merged: Mutex<Vec<(u32, u32, usize)>>,
}

#[async_trait]
impl MergeSink for RecordingSink {
    async fn merge(&self, chunk_id: ChunkId, attempt: u32, batch: RowBatch) -> Result<()> {
        self.merged
            .lock()
            .unwrap()
            .push((chunk_id.0, attempt, batch.rows.len()));
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

fn ok_frames(query_id: u64, chunk_id: u32, attempt: u32) -> Vec<Vec<u8>> {
    let first = RowBatch {
        schema: Some(schema()),
        rows: vec![vec![Some("10".to_string())]],
    };
    let second = RowBatch {
        schema: None,
        rows: vec![vec![Some("32".to_string())]],
    };
    vec![
        encode_batch_frame(query_id, chunk_id, attempt, 1, false, &first).unwrap(),
        encode_batch_frame(query_id, chunk_id, attempt, 1, true, &second).unwrap(),
    ]
}

fn test_config() -> DispatchConfig {
    DispatchConfig {
        max_attempts: 3,
        retry_backoff_base_ms: 5,
        job_timeout_ms: 250,
        max_in_flight: 8,
    }
}

fn build(
    transport: Arc<ScriptedTransport>,
    sink: Arc<RecordingSink>,
) -> Arc<Executive> {
    Executive::new(
        QueryId(7),
        SessionId(1),
        test_config(),
        transport,
        sink,
        Arc::new(Semaphore::new(32)),
    )
}

fn jobs(chunks: &[u32]) -> Vec<JobInput> {
    chunks
        .iter()
        .map(|c| JobInput {
            chunk_id: ChunkId(*c),
            sql: format!("SELECT COUNT(*) AS QS1_COUNT FROM LSST.Object_{c}"),
        })
        .collect()
}

#[tokio::test]
async fn completes_all_jobs_and_merges_each_chunk() {
    let transport = Arc::new(ScriptedTransport::default());
    let sink = Arc::new(RecordingSink::default());
    let exec = build(Arc::clone(&transport), Arc::clone(&sink));

    exec.submit(jobs(&[100, 101, 102]));
    let result = exec.join().await;

    assert_eq!(result.outcome, QueryOutcome::Complete);
    assert!(result.error.is_none());
    let states = exec.job_states();
    assert!(states.values().all(|s| *s == JobState::Done));

    let merged = sink.merged.lock().unwrap().clone();
    let mut chunks: Vec<u32> = merged.iter().map(|(c, _, _)| *c).collect();
    chunks.sort_unstable();
    chunks.dedup();
    assert_eq!(chunks, vec![100, 101, 102]);
}

#[tokio::test]
async fn transient_faults_retry_then_succeed() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.script(
        100,
        vec![
            Script::Transient,
            Script::Transient,
            Script::Frames(ok_frames(7, 100, 3)),
        ],
    );
    let sink = Arc::new(RecordingSink::default());
    let exec = build(Arc::clone(&transport), Arc::clone(&sink));

    exec.submit(jobs(&[100]));
    let result = exec.join().await;

    assert_eq!(result.outcome, QueryOutcome::Complete);
    // Exactly one contribution despite the retries.
    let merged = sink.merged.lock().unwrap().clone();
    assert!(merged.iter().all(|(c, attempt, _)| *c == 100 && *attempt == 3));
    assert_eq!(merged.len(), 2);
}

#[tokio::test]
async fn exhausted_retries_escalate_to_worker_failure() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.script(
        100,
        vec![Script::Transient, Script::Transient, Script::Transient],
    );
    let sink = Arc::new(RecordingSink::default());
    let exec = build(transport, sink);

    exec.submit(jobs(&[100]));
    let result = exec.join().await;

    assert_eq!(result.outcome, QueryOutcome::Failed);
    assert!(matches!(result.error, Some(CzarError::WorkerFailure(_))));
}

#[tokio::test]
async fn corrupt_stream_fails_query_and_cancels_peers() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut bad = ok_frames(7, 100, 1);
    let n = bad[0].len();
    bad[0][n - 1] ^= 0xff;
    transport.script(100, vec![Script::Frames(bad)]);
    transport.script(101, vec![Script::Hang]);

    let sink = Arc::new(RecordingSink::default());
    let exec = build(Arc::clone(&transport), sink);

    exec.submit(jobs(&[100, 101]));
    let result = exec.join().await;

    assert_eq!(result.outcome, QueryOutcome::Failed);
    assert!(matches!(result.error, Some(CzarError::ResultCorrupt(_))));
    let states = exec.job_states();
    assert_eq!(states[&ChunkId(100)], JobState::Failed);
    assert_eq!(states[&ChunkId(101)], JobState::Cancelled);
}

#[tokio::test]
async fn cancel_mid_flight_terminates_without_failure() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.script(100, vec![Script::Hang]);
    transport.script(101, vec![Script::Hang]);
    let sink = Arc::new(RecordingSink::default());
    let exec = build(Arc::clone(&transport), Arc::clone(&sink));

    exec.submit(jobs(&[100, 101]));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    exec.cancel().await;
    let result = exec.join().await;

    assert_eq!(result.outcome, QueryOutcome::Cancelled);
    assert!(result.error.is_none());
    assert!(sink.merged.lock().unwrap().is_empty());
    assert!(!transport.cancelled().is_empty());
    let states = exec.job_states();
    assert!(states.values().all(|s| *s == JobState::Cancelled));
}

#[tokio::test]
async fn cancel_before_dispatch_skips_new_jobs() {
    let transport = Arc::new(ScriptedTransport::default());
    let sink = Arc::new(RecordingSink::default());
    // One in-flight slot so later jobs sit in NEW while the first hangs.
    let exec = Executive::new(
        QueryId(7),
        SessionId(1),
        DispatchConfig {
            max_in_flight: 1,
            ..test_config()
        },
        Arc::clone(&transport) as Arc<dyn ChunkTransport>,
        Arc::clone(&sink) as Arc<dyn MergeSink>,
        Arc::new(Semaphore::new(32)),
    );
    transport.script(100, vec![Script::Hang]);

    exec.submit(jobs(&[100, 101, 102]));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    exec.cancel().await;
    let result = exec.join().await;

    assert_eq!(result.outcome, QueryOutcome::Cancelled);
    assert!(sink.merged.lock().unwrap().is_empty());
}
