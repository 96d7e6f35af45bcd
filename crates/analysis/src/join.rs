//! Join rewrite: match-table expansion and natural/USING join elimination.
//!
//! Match tables bridge two director tables; the rewriter turns a query
//! touching a match table into the canonical three-way join by injecting the
//! match table's foreign-key equalities. Natural joins are expanded to
//! explicit ON predicates over the partition relationship, so every chunk
//! query ships with self-contained join conditions.

use skyq_common::{CzarError, Result};
use skyq_metadata::TableInfo;
use skyq_query::{BinaryOp, Expr, JoinConstraint, SelectStmt};

use crate::scope::Binding;

/// Rewrite joins in place.
pub fn rewrite(stmt: &mut SelectStmt, bindings: &[Binding]) -> Result<()> {
    if bindings.is_empty() {
        return Ok(());
    }
    check_partitionings(bindings)?;
    expand_natural_and_using(stmt, bindings)?;
    inject_match_equalities(stmt, bindings)?;
    Ok(())
}

/// Every partitioned table in one statement must belong to one partitioning.
fn check_partitionings(bindings: &[Binding]) -> Result<()> {
    let mut seen: Option<u32> = None;
    for b in bindings {
        if let Some(dir) = b.info.director() {
            match seen {
                None => seen = Some(dir.partitioning_id),
                Some(id) if id != dir.partitioning_id => {
                    return Err(CzarError::Unsupported(
                        "joins across different partitionings are not accepted".to_string(),
                    ));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

fn eq(left_name: &str, left_col: &str, right_name: &str, right_col: &str) -> Expr {
    Expr::Binary {
        left: Box::new(Expr::Column {
            qualifier: Some(left_name.to_string()),
            name: left_col.to_string(),
        }),
        op: BinaryOp::Eq,
        right: Box::new(Expr::Column {
            qualifier: Some(right_name.to_string()),
            name: right_col.to_string(),
        }),
    }
}

fn and_all(exprs: Vec<Expr>) -> Option<Expr> {
    exprs.into_iter().reduce(|acc, e| Expr::Binary {
        left: Box::new(acc),
        op: BinaryOp::And,
        right: Box::new(e),
    })
}

/// Find the partition-key equality tying `right` to one earlier binding.
fn natural_predicate(right: &Binding, earlier: &[Binding]) -> Option<Expr> {
    match right.info.as_ref() {
        TableInfo::Child(child) => earlier.iter().find_map(|b| match b.info.as_ref() {
            TableInfo::Director(d) if d.as_ref() == child.director.as_ref() => {
                Some(eq(&right.name, &child.fk, &b.name, &d.pk))
            }
            TableInfo::Child(other) if other.director.as_ref() == child.director.as_ref() => {
                Some(eq(&right.name, &child.fk, &b.name, &other.fk))
            }
            _ => None,
        }),
        TableInfo::Director(dir) => earlier.iter().find_map(|b| match b.info.as_ref() {
            TableInfo::Child(child) if child.director.as_ref() == dir.as_ref() => {
                Some(eq(&b.name, &child.fk, &right.name, &dir.pk))
            }
            _ => None,
        }),
        // Match tables get their equalities injected separately.
        TableInfo::Match(_) => Some(Expr::Literal(skyq_query::Literal::Bool(true))),
        TableInfo::Unpartitioned { .. } => None,
    }
}

fn expand_natural_and_using(stmt: &mut SelectStmt, bindings: &[Binding]) -> Result<()> {
    let Some(from) = &mut stmt.from else {
        return Ok(());
    };
    for (i, join) in from.joins.iter_mut().enumerate() {
        let right = &bindings[i + 1];
        match &join.constraint {
            JoinConstraint::Natural => {
                let Some(pred) = natural_predicate(right, &bindings[..=i]) else {
                    return Err(CzarError::Unsupported(format!(
                        "NATURAL join with {} has no recognized partition relationship",
                        right.info
                    )));
                };
                join.constraint = match pred {
                    // Match-table naturals are resolved by equality injection.
                    Expr::Literal(skyq_query::Literal::Bool(true)) => JoinConstraint::None,
                    pred => JoinConstraint::On(pred),
                };
            }
            JoinConstraint::Using(cols) => {
                let left = &bindings[i];
                let preds = cols
                    .iter()
                    .map(|c| eq(&left.name, c, &right.name, c))
                    .collect::<Vec<_>>();
                let Some(pred) = and_all(preds) else {
                    return Err(CzarError::Unsupported(
                        "USING join lists no columns".to_string(),
                    ));
                };
                join.constraint = JoinConstraint::On(pred);
            }
            JoinConstraint::On(_) | JoinConstraint::None => {}
        }
    }
    Ok(())
}

fn inject_match_equalities(stmt: &mut SelectStmt, bindings: &[Binding]) -> Result<()> {
    for (idx, b) in bindings.iter().enumerate() {
        let TableInfo::Match(m) = b.info.as_ref() else {
            continue;
        };
        if (m.dir1.0.overlap_deg - m.dir2.0.overlap_deg).abs() > f64::EPSILON {
            return Err(CzarError::InvalidMetadata(format!(
                "match table {} relates directors with different overlaps",
                b.info
            )));
        }
        let dir_binding = |db: &str, table: &str| {
            bindings.iter().find(|cand| {
                matches!(cand.info.as_ref(), TableInfo::Director(d)
                    if d.db == db && d.table == table)
            })
        };
        let Some(first) = dir_binding(&m.dir1.0.db, &m.dir1.0.table) else {
            return Err(CzarError::Unsupported(format!(
                "match table {} requires director {} in FROM",
                b.info, m.dir1.0.table
            )));
        };
        let Some(second) = dir_binding(&m.dir2.0.db, &m.dir2.0.table) else {
            return Err(CzarError::Unsupported(format!(
                "match table {} requires director {} in FROM",
                b.info, m.dir2.0.table
            )));
        };
        let preds = vec![
            eq(&b.name, &m.dir1.1, &first.name, &m.dir1.0.pk),
            eq(&b.name, &m.dir2.1, &second.name, &m.dir2.0.pk),
        ];
        let injected = and_all(preds).expect("two match predicates");

        let from = stmt.from.as_mut().expect("match binding implies FROM");
        if idx == 0 {
            // The match table leads FROM; the equalities become WHERE conjuncts.
            stmt.where_clause = Some(match stmt.where_clause.take() {
                Some(w) => Expr::Binary {
                    left: Box::new(injected),
                    op: BinaryOp::And,
                    right: Box::new(w),
                },
                None => injected,
            });
        } else {
            let join = &mut from.joins[idx - 1];
            join.constraint = match join.constraint.clone() {
                JoinConstraint::On(on) => JoinConstraint::On(Expr::Binary {
                    left: Box::new(injected),
                    op: BinaryOp::And,
                    right: Box::new(on),
                }),
                JoinConstraint::None | JoinConstraint::Natural => JoinConstraint::On(injected),
                JoinConstraint::Using(_) => JoinConstraint::On(injected),
            };
        }
    }
    Ok(())
}
