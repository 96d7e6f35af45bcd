//! SQL statement model and chunk query templates.
//!
//! Architecture role:
//! - parses one user `SELECT` via sqlparser and lowers it into a czar-owned
//!   statement model ([`ast`]);
//! - renders statements into [`template::QueryTemplate`]s whose typed
//!   placeholders are substituted per `(db, chunk, subchunk)` work unit with
//!   no textual reparsing.

pub mod ast;
pub mod parse;
pub mod template;

pub use ast::{
    BinaryOp, Expr, FromClause, Join, JoinConstraint, JoinKind, Literal, OrderByItem, SelectItem,
    SelectStmt, TableRef,
};
pub use parse::{parse_select, parse_sql};
pub use template::{ChunkTarget, QueryTemplate, TemplateEntry, TemplateMapping};
