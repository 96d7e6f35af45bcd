//! Dispatch and streaming-result engine.
//!
//! Architecture role:
//! - owns the per-user-query set of chunk jobs and their lifecycles
//!   ([`executive`], [`job`]);
//! - defines the result frame wire format and its validation
//!   ([`frame`], [`reader`]);
//! - abstracts the worker fleet behind [`transport::ChunkTransport`], with a
//!   tonic implementation in [`grpc`] (feature `grpc`).
//!
//! Retry/attempt semantics:
//! - attempts are explicit in requests and frame headers;
//! - the validator discards frames from superseded attempts so each
//!   `(query, chunk)` contributes at most one attempt to the merge.

pub mod executive;
pub mod frame;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod job;
pub mod reader;
pub mod transport;

#[cfg(test)]
mod executive_tests;

pub use executive::{DispatchConfig, Executive, JobInput, JoinResult, MergeSink, QueryOutcome};
pub use frame::{ColumnSchema, FrameHeader, RowBatch, RowSchema};
pub use job::{ChunkJob, JobState};
pub use reader::FrameValidator;
pub use transport::{ChunkRequest, ChunkTransport, FrameStream};
