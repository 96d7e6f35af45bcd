//! Scope resolution and partition classification.
//!
//! Fills in database qualifiers from the default database, attaches table
//! metadata to every FROM reference, assigns generated aliases to partitioned
//! references, and re-points column qualifiers at those aliases. Later passes
//! work purely on bindings.

use std::sync::Arc;

use skyq_common::{CzarError, Result};
use skyq_metadata::TableInfo;
use skyq_query::{Expr, SelectStmt};

use crate::context::AnalysisContext;

/// One resolved FROM entry: its binding name and metadata.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Alias (user or generated) or table name.
    pub name: String,
    /// Attached metadata.
    pub info: Arc<TableInfo>,
}

/// Resolve scope for a statement in place and classify its tables.
pub fn resolve(stmt: &mut SelectStmt, ctx: &AnalysisContext) -> Result<Vec<Binding>> {
    let Some(from) = &mut stmt.from else {
        return Ok(Vec::new());
    };

    let mut bindings = Vec::new();
    let mut renames: Vec<(String, String)> = Vec::new();
    let mut any_partitioned = false;

    // First pass: fill db qualifiers and attach metadata.
    for table in from.tables_mut() {
        if table.db.is_none() {
            table.db = ctx.default_db.clone();
        }
        let Some(db) = table.db.clone() else {
            return Err(CzarError::Unsupported(format!(
                "table '{}' has no database qualifier and no default database was given",
                table.table
            )));
        };
        let info = ctx.metadata.get(&db, &table.table)?;
        any_partitioned |= info.is_partitioned();
        bindings.push(Binding {
            name: table.binding_name().to_string(),
            info,
        });
    }

    // Second pass: partitioned statements get stable generated aliases so
    // per-chunk table names never leak into column references.
    if any_partitioned {
        for (i, table) in from.tables_mut().enumerate() {
            if table.alias.is_none() {
                let alias = format!("QST_{}_", i + 1);
                renames.push((table.table.clone(), alias.clone()));
                table.alias = Some(alias.clone());
                bindings[i].name = alias;
            }
        }
    }

    if !renames.is_empty() {
        stmt.walk_exprs_mut(&mut |e| {
            if let Expr::Column {
                qualifier: Some(q), ..
            } = e
            {
                if let Some((_, alias)) = renames.iter().find(|(t, _)| t == q) {
                    *q = alias.clone();
                }
            }
        });
    }

    // Qualified column references must name a known binding.
    let mut bad: Option<String> = None;
    stmt.walk_exprs_mut(&mut |e| {
        if let Expr::Column {
            qualifier: Some(q), ..
        } = e
        {
            if bad.is_none() && !bindings.iter().any(|b| &b.name == q) {
                bad = Some(q.clone());
            }
        }
    });
    if let Some(q) = bad {
        return Err(CzarError::Unsupported(format!(
            "column qualifier '{q}' does not match any table in FROM"
        )));
    }

    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyq_metadata::{InMemoryMetaStore, MetadataCache, StripingParams, TableParams};
    use skyq_query::parse_select;

    fn ctx() -> AnalysisContext {
        let store = Arc::new(InMemoryMetaStore::new());
        store.put_striping(
            "LSST",
            StripingParams {
                stripes: 18,
                sub_stripes: 10,
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
        store.put_table("LSST", "Filter", TableParams::default());
        AnalysisContext::new(Arc::new(MetadataCache::new(store)), Some("LSST".into()))
    }

    #[test]
    fn fills_default_db_and_assigns_alias() {
        let mut stmt = parse_select("SELECT mag FROM Object WHERE mag > 20").unwrap();
        let bindings = resolve(&mut stmt, &ctx()).unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].name, "QST_1_");
        let from = stmt.from.as_ref().unwrap();
        assert_eq!(from.first.db.as_deref(), Some("LSST"));
        assert_eq!(from.first.alias.as_deref(), Some("QST_1_"));
    }

    #[test]
    fn rewrites_table_name_qualifiers_to_alias() {
        let mut stmt = parse_select("SELECT Object.mag FROM Object").unwrap();
        resolve(&mut stmt, &ctx()).unwrap();
        match &stmt.select[0].expr {
            Expr::Column { qualifier, .. } => {
                assert_eq!(qualifier.as_deref(), Some("QST_1_"));
            }
            other => panic!("unexpected expr {other:?}"),
        }
    }

    #[test]
    fn keeps_user_alias() {
        let mut stmt = parse_select("SELECT o.mag FROM Object o").unwrap();
        let bindings = resolve(&mut stmt, &ctx()).unwrap();
        assert_eq!(bindings[0].name, "o");
    }

    #[test]
    fn unknown_qualifier_is_rejected() {
        let mut stmt = parse_select("SELECT x.mag FROM Object o").unwrap();
        assert!(matches!(
            resolve(&mut stmt, &ctx()),
            Err(CzarError::Unsupported(_))
        ));
    }

    #[test]
    fn unpartitioned_tables_keep_their_names() {
        let mut stmt = parse_select("SELECT name FROM Filter").unwrap();
        let bindings = resolve(&mut stmt, &ctx()).unwrap();
        assert_eq!(bindings[0].name, "Filter");
        assert!(stmt.from.as_ref().unwrap().first.alias.is_none());
    }

    #[test]
    fn unknown_table_surfaces() {
        let mut stmt = parse_select("SELECT a FROM Missing").unwrap();
        assert!(matches!(
            resolve(&mut stmt, &ctx()),
            Err(CzarError::UnknownTable(_))
        ));
    }
}
