//! Result frame wire format.
//!
//! Layout: 4-byte magic, 4-byte little-endian header length, a JSON-encoded
//! [`FrameHeader`], then the payload bytes the header describes. The header
//! carries the payload length, its md5, the end-of-stream flag, and the
//! `(userQueryId, chunkId, attempt)` identity used for stale-attempt
//! discarding. The payload is a JSON-encoded [`RowBatch`]; only the first
//! frame of a stream carries the row schema.

use serde::{Deserialize, Serialize};
use skyq_common::{CzarError, Result};

const FRAME_MAGIC: &[u8; 4] = b"SQRF";
const FRAME_PREFIX_LEN: usize = 8;

/// One column of the worker-reported result schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// SQL type as reported by the worker (e.g. `BIGINT`, `DOUBLE`).
    pub sql_type: String,
    /// Whether NULLs may appear.
    pub nullable: bool,
}

/// Worker-reported result schema; identical across chunks of one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSchema {
    /// Columns in projection order.
    pub columns: Vec<ColumnSchema>,
}

/// One streamed batch of result rows.
///
/// Values are SQL text; `None` encodes NULL. The schema rides along on the
/// first frame of each job stream only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RowBatch {
    /// Schema descriptor, first frame only.
    pub schema: Option<RowSchema>,
    /// Row values in schema column order.
    pub rows: Vec<Vec<Option<String>>>,
}

/// Frame protocol header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// User query this frame belongs to.
    pub query_id: u64,
    /// Chunk this frame belongs to.
    pub chunk_id: u32,
    /// Dispatch attempt that produced this frame.
    pub attempt: u32,
    /// Session the query runs under.
    pub session: u32,
    /// Payload length in bytes.
    pub payload_len: u64,
    /// Lowercase hex md5 of the payload.
    pub md5: String,
    /// End-of-stream marker.
    pub last: bool,
}

/// Encode a frame, computing payload length and checksum.
pub fn encode_frame(
    query_id: u64,
    chunk_id: u32,
    attempt: u32,
    session: u32,
    last: bool,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let header = FrameHeader {
        query_id,
        chunk_id,
        attempt,
        session,
        payload_len: payload.len() as u64,
        md5: format!("{:x}", md5::compute(payload)),
        last,
    };
    let header_bytes = serde_json::to_vec(&header)
        .map_err(|e| CzarError::ResultCorrupt(format!("header encode failed: {e}")))?;
    let mut out = Vec::with_capacity(FRAME_PREFIX_LEN + header_bytes.len() + payload.len());
    out.extend_from_slice(FRAME_MAGIC);
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encode a row batch into a complete frame.
pub fn encode_batch_frame(
    query_id: u64,
    chunk_id: u32,
    attempt: u32,
    session: u32,
    last: bool,
    batch: &RowBatch,
) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(batch)
        .map_err(|e| CzarError::ResultCorrupt(format!("payload encode failed: {e}")))?;
    encode_frame(query_id, chunk_id, attempt, session, last, &payload)
}

/// Decode and validate one frame.
///
/// Enforces: magic, the size prefix fits the buffer, the declared payload
/// length matches the remaining bytes, and the payload md5 matches the
/// header. All violations are `ResultCorrupt`.
pub fn decode_frame(buf: &[u8]) -> Result<(FrameHeader, &[u8])> {
    if buf.len() < FRAME_PREFIX_LEN {
        return Err(CzarError::ResultCorrupt(
            "frame shorter than size prefix".to_string(),
        ));
    }
    if &buf[0..4] != FRAME_MAGIC {
        return Err(CzarError::ResultCorrupt("bad frame magic".to_string()));
    }
    let header_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if buf.len() < FRAME_PREFIX_LEN + header_len {
        return Err(CzarError::ResultCorrupt(
            "size prefix exceeds frame size".to_string(),
        ));
    }
    let header: FrameHeader =
        serde_json::from_slice(&buf[FRAME_PREFIX_LEN..FRAME_PREFIX_LEN + header_len])
            .map_err(|e| CzarError::ResultCorrupt(format!("header decode failed: {e}")))?;
    let payload = &buf[FRAME_PREFIX_LEN + header_len..];
    if payload.len() as u64 != header.payload_len {
        return Err(CzarError::ResultCorrupt(format!(
            "declared payload length {} does not match {} received bytes",
            header.payload_len,
            payload.len()
        )));
    }
    let computed = format!("{:x}", md5::compute(payload));
    if computed != header.md5 {
        return Err(CzarError::ResultCorrupt(
            "payload md5 does not match header".to_string(),
        ));
    }
    Ok((header, payload))
}

/// Decode a frame's payload into a row batch.
pub fn decode_batch(payload: &[u8]) -> Result<RowBatch> {
    serde_json::from_slice(payload)
        .map_err(|e| CzarError::ResultCorrupt(format!("row batch decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> RowBatch {
        RowBatch {
            schema: Some(RowSchema {
                columns: vec![ColumnSchema {
                    name: "QS1_COUNT".to_string(),
                    sql_type: "BIGINT".to_string(),
                    nullable: false,
                }],
            }),
            rows: vec![vec![Some("42".to_string())]],
        }
    }

    #[test]
    fn round_trips() {
        let frame = encode_batch_frame(7, 100, 1, 3, true, &batch()).unwrap();
        let (header, payload) = decode_frame(&frame).unwrap();
        assert_eq!(header.query_id, 7);
        assert_eq!(header.chunk_id, 100);
        assert_eq!(header.attempt, 1);
        assert!(header.last);
        assert_eq!(decode_batch(payload).unwrap(), batch());
    }

    #[test]
    fn corrupt_payload_fails_md5() {
        let mut frame = encode_batch_frame(7, 100, 1, 3, false, &batch()).unwrap();
        let n = frame.len();
        frame[n - 1] ^= 0xff;
        assert!(matches!(
            decode_frame(&frame),
            Err(CzarError::ResultCorrupt(_))
        ));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = encode_batch_frame(7, 100, 1, 3, false, &batch()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 2]),
            Err(CzarError::ResultCorrupt(_))
        ));
        assert!(matches!(
            decode_frame(&frame[..4]),
            Err(CzarError::ResultCorrupt(_))
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut frame = encode_batch_frame(7, 100, 1, 3, false, &batch()).unwrap();
        frame[0] = b'X';
        assert!(matches!(
            decode_frame(&frame),
            Err(CzarError::ResultCorrupt(_))
        ));
    }
}
