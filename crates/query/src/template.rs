//! Chunk query templates.
//!
//! A template is an ordered sequence of literal SQL fragments and typed
//! placeholders. Rendering applies a [`TemplateMapping`] to produce one
//! concrete per-chunk SQL string; an unfilled placeholder is an error, so a
//! sub-chunk template can never silently render as a chunk-only query.

use serde::{Deserialize, Serialize};
use skyq_common::{CzarError, Result};

/// How a table reference is rewritten per work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChunkTarget {
    /// Plain table, no per-chunk rewrite.
    #[default]
    None,
    /// `<table>_<chunk>`.
    Chunked,
    /// `<table>_<chunk>_<subchunk>`.
    SubChunked,
}

/// One template element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TemplateEntry {
    /// Verbatim SQL text.
    Literal(String),
    /// Default database placeholder.
    Db,
    /// Chunk id placeholder.
    Chunk,
    /// Sub-chunk id placeholder.
    SubChunk,
    /// Table reference rewritten according to its chunk target.
    Table {
        /// Database qualifier; `None` renders the mapping's database.
        db: Option<String>,
        /// Base table name.
        name: String,
        /// Per-chunk rewrite mode.
        chunking: ChunkTarget,
    },
}

/// Substitution values applied at render time.
#[derive(Debug, Clone, Default)]
pub struct TemplateMapping {
    /// Default database for unqualified table entries and `{DB}`.
    pub db: Option<String>,
    /// Chunk id.
    pub chunk: Option<u32>,
    /// Sub-chunk id.
    pub subchunk: Option<u32>,
}

impl TemplateMapping {
    /// Mapping for a chunk-only work unit.
    pub fn chunk(db: impl Into<String>, chunk: u32) -> Self {
        Self {
            db: Some(db.into()),
            chunk: Some(chunk),
            subchunk: None,
        }
    }

    /// Mapping for a sub-chunked work unit.
    pub fn sub_chunk(db: impl Into<String>, chunk: u32, subchunk: u32) -> Self {
        Self {
            db: Some(db.into()),
            chunk: Some(chunk),
            subchunk: Some(subchunk),
        }
    }
}

/// An ordered literal/placeholder sequence renderable into SQL.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryTemplate {
    entries: Vec<TemplateEntry>,
}

impl QueryTemplate {
    /// Create an empty template.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append literal text, coalescing with a preceding literal.
    pub fn push_literal(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if text.is_empty() {
            return;
        }
        if let Some(TemplateEntry::Literal(prev)) = self.entries.last_mut() {
            prev.push_str(text);
        } else {
            self.entries.push(TemplateEntry::Literal(text.to_string()));
        }
    }

    /// Append a placeholder or table entry.
    pub fn push(&mut self, entry: TemplateEntry) {
        match entry {
            TemplateEntry::Literal(text) => self.push_literal(text),
            other => self.entries.push(other),
        }
    }

    /// Entries in order.
    pub fn entries(&self) -> &[TemplateEntry] {
        &self.entries
    }

    /// Whether rendering requires a sub-chunk id.
    pub fn needs_sub_chunk(&self) -> bool {
        self.entries.iter().any(|e| {
            matches!(e, TemplateEntry::SubChunk)
                || matches!(
                    e,
                    TemplateEntry::Table {
                        chunking: ChunkTarget::SubChunked,
                        ..
                    }
                )
        })
    }

    /// Whether rendering requires a chunk id.
    pub fn needs_chunk(&self) -> bool {
        self.entries.iter().any(|e| {
            matches!(e, TemplateEntry::Chunk)
                || matches!(
                    e,
                    TemplateEntry::Table {
                        chunking: ChunkTarget::Chunked | ChunkTarget::SubChunked,
                        ..
                    }
                )
        }) || self.needs_sub_chunk()
    }

    /// Render into a concrete SQL string.
    pub fn render(&self, mapping: &TemplateMapping) -> Result<String> {
        let mut out = String::new();
        for entry in &self.entries {
            match entry {
                TemplateEntry::Literal(text) => out.push_str(text),
                TemplateEntry::Db => out.push_str(require_db(mapping)?),
                TemplateEntry::Chunk => out.push_str(&require_chunk(mapping)?.to_string()),
                TemplateEntry::SubChunk => out.push_str(&require_subchunk(mapping)?.to_string()),
                TemplateEntry::Table { db, name, chunking } => {
                    let db = match db {
                        Some(db) => db.as_str(),
                        None => require_db(mapping)?,
                    };
                    out.push_str(db);
                    out.push('.');
                    out.push_str(name);
                    match chunking {
                        ChunkTarget::None => {}
                        ChunkTarget::Chunked => {
                            out.push('_');
                            out.push_str(&require_chunk(mapping)?.to_string());
                        }
                        ChunkTarget::SubChunked => {
                            out.push('_');
                            out.push_str(&require_chunk(mapping)?.to_string());
                            out.push('_');
                            out.push_str(&require_subchunk(mapping)?.to_string());
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

fn require_db(mapping: &TemplateMapping) -> Result<&str> {
    mapping
        .db
        .as_deref()
        .ok_or_else(|| CzarError::InvalidConfig("template requires a database mapping".into()))
}

fn require_chunk(mapping: &TemplateMapping) -> Result<u32> {
    mapping
        .chunk
        .ok_or_else(|| CzarError::InvalidConfig("template requires a chunk id".into()))
}

fn require_subchunk(mapping: &TemplateMapping) -> Result<u32> {
    mapping
        .subchunk
        .ok_or_else(|| CzarError::InvalidConfig("template requires a sub-chunk id".into()))
}
