//! Merge-table SQL forming and row-batch encoding.
//!
//! The merge table is created from the worker-reported row schema; row
//! batches are encoded as tab-separated infile buffers (`\N` for NULL) that
//! `LOAD DATA LOCAL INFILE` consumes from a virtual file handle.

use skyq_common::{CzarError, Result};
use skyq_dispatch::{RowBatch, RowSchema};

/// `CREATE TABLE IF NOT EXISTS` statement for the merge table.
pub fn form_create_table(table: &str, schema: &RowSchema) -> String {
    let cols = schema
        .columns
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("`{}` {}{}", c.name, c.sql_type, null)
        })
        .collect::<Vec<_>>()
        .join(",");
    format!("CREATE TABLE IF NOT EXISTS {table} ({cols})")
}

/// `LOAD DATA LOCAL INFILE` statement reading a virtual file.
pub fn form_load_infile(table: &str, virt_file: &str) -> String {
    format!(
        "LOAD DATA LOCAL INFILE '{virt_file}' INTO TABLE {table} \
         FIELDS TERMINATED BY '\\t' LINES TERMINATED BY '\\n'"
    )
}

/// Encode a row batch as an infile buffer.
pub fn encode_infile(batch: &RowBatch) -> Vec<u8> {
    let mut out = Vec::new();
    for row in &batch.rows {
        encode_row(row, &mut out);
    }
    out
}

/// Encode a row batch as infile buffers of at most `buffer_bytes` each.
///
/// Rows are never split across buffers, so a single oversized row still
/// yields one (oversized) buffer.
pub fn encode_infile_chunks(batch: &RowBatch, buffer_bytes: usize) -> Vec<Vec<u8>> {
    let cap = buffer_bytes.max(1);
    let mut out = Vec::new();
    let mut current = Vec::new();
    for row in &batch.rows {
        let mut encoded = Vec::new();
        encode_row(row, &mut encoded);
        if !current.is_empty() && current.len() + encoded.len() > cap {
            out.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(&encoded);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn encode_row(row: &[Option<String>], out: &mut Vec<u8>) {
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            out.push(b'\t');
        }
        match value {
            Some(v) => out.extend_from_slice(escape_field(v).as_bytes()),
            None => out.extend_from_slice(b"\\N"),
        }
    }
    out.push(b'\n');
}

fn escape_field(v: &str) -> String {
    v.replace('\\', "\\\\")
        .replace('\t', "\\t")
        .replace('\n', "\\n")
}

/// Compare the received schema against the cached one.
///
/// Column count, names and SQL types must all match; any disagreement means
/// the result stream is corrupt for this user query.
pub fn reconcile(cached: &RowSchema, received: &RowSchema) -> Result<()> {
    if cached.columns.len() != received.columns.len() {
        return Err(CzarError::ResultCorrupt(format!(
            "result schema has {} columns, expected {}",
            received.columns.len(),
            cached.columns.len()
        )));
    }
    for (a, b) in cached.columns.iter().zip(&received.columns) {
        if a.name != b.name {
            return Err(CzarError::ResultCorrupt(format!(
                "result column '{}' does not match expected '{}'",
                b.name, a.name
            )));
        }
        if !a.sql_type.eq_ignore_ascii_case(&b.sql_type) {
            return Err(CzarError::ResultCorrupt(format!(
                "result column '{}' has type {}, expected {}",
                a.name, b.sql_type, a.sql_type
            )));
        }
    }
    Ok(())
}
