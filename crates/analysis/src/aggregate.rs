//! Aggregation split: one parallel/merge pair per select-list aggregate.
//!
//! Decomposable aggregates run per chunk under generated `QS<n>_<OP>`
//! aliases and are re-reduced on the merge table:
//! `COUNT -> SUM`, `SUM -> SUM`, `MIN/MAX -> MIN/MAX`,
//! `AVG -> COUNT + SUM` re-divided at merge.
//!
//! Non-decomposable aggregates fall back to merge-only execution: the raw
//! select runs per chunk and the original select is re-run over the merged
//! rows. `DISTINCT` in that mode is rejected rather than silently mis-reduced.

use skyq_common::{CzarError, Result};
use skyq_query::{Expr, SelectItem};

/// How the select list splits across parallel and merge sides.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitOutcome {
    /// No aggregates; chunk queries project the original list.
    NoAggregates,
    /// Every aggregate decomposed into a parallel/merge pair.
    Decomposed {
        /// Select list for the per-chunk query.
        parallel: Vec<SelectItem>,
        /// Select list for the fix-up over the merge table.
        fixup: Vec<SelectItem>,
    },
    /// Raw select per chunk; original select re-run on the merge table.
    MergeOnly,
}

const DECOMPOSABLE: [&str; 5] = ["COUNT", "SUM", "AVG", "MIN", "MAX"];
const OPAQUE_AGGREGATES: [&str; 9] = [
    "GROUP_CONCAT",
    "VARIANCE",
    "VAR_POP",
    "VAR_SAMP",
    "STDDEV",
    "STDDEV_POP",
    "STDDEV_SAMP",
    "BIT_AND",
    "BIT_OR",
];

fn is_aggregate_name(name: &str) -> bool {
    let up = name.to_ascii_uppercase();
    DECOMPOSABLE.contains(&up.as_str()) || OPAQUE_AGGREGATES.contains(&up.as_str())
}

/// Whether any aggregate call appears anywhere in the expression.
pub fn contains_aggregate(expr: &Expr) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
        if let Expr::Func { name, .. } = e {
            if is_aggregate_name(name) {
                found = true;
            }
        }
    });
    found
}

/// Split a select list into parallel and merge sides.
///
/// `select_distinct` is the statement-level `DISTINCT` flag; combined with a
/// non-decomposable aggregate it is rejected.
pub fn split(select: &[SelectItem], select_distinct: bool) -> Result<SplitOutcome> {
    let any_aggregate = select.iter().any(|i| contains_aggregate(&i.expr));
    if !any_aggregate {
        if select_distinct {
            // DISTINCT has to dedupe across chunks; re-run on the merge table.
            return Ok(SplitOutcome::MergeOnly);
        }
        return Ok(SplitOutcome::NoAggregates);
    }

    // Decide decomposability over the whole list first: one opaque item
    // forces the whole statement into merge-only mode.
    let mut decomposable = true;
    for item in select {
        match classify(&item.expr)? {
            ItemKind::PlainAggregate { .. } | ItemKind::Passthrough => {}
            ItemKind::Opaque => decomposable = false,
        }
    }
    if !decomposable {
        if select_distinct {
            return Err(CzarError::Unsupported(
                "DISTINCT cannot be combined with a non-decomposable aggregate".to_string(),
            ));
        }
        return Ok(SplitOutcome::MergeOnly);
    }
    if select_distinct {
        return Err(CzarError::Unsupported(
            "DISTINCT with aggregates is not accepted".to_string(),
        ));
    }

    let mut parallel = Vec::new();
    let mut fixup = Vec::new();
    let mut counter = 0_u32;
    for item in select {
        match classify(&item.expr)? {
            ItemKind::PlainAggregate { op, args } => {
                decompose(item, &op, args, &mut counter, &mut parallel, &mut fixup);
            }
            ItemKind::Passthrough => {
                parallel.push(item.clone());
                fixup.push(SelectItem {
                    expr: merge_ref(item),
                    alias: item.alias.clone(),
                });
            }
            ItemKind::Opaque => unreachable!("opaque items force merge-only"),
        }
    }
    Ok(SplitOutcome::Decomposed { parallel, fixup })
}

enum ItemKind {
    /// A single decomposable aggregate call at the top of the item.
    PlainAggregate { op: String, args: Vec<Expr> },
    /// No aggregate anywhere (a group-by column or plain expression).
    Passthrough,
    /// Aggregates present but not in decomposable shape.
    Opaque,
}

fn classify(expr: &Expr) -> Result<ItemKind> {
    match expr {
        Expr::Func {
            name,
            distinct,
            args,
        } if is_aggregate_name(name) => {
            if *distinct {
                return Err(CzarError::Unsupported(format!(
                    "DISTINCT inside {} cannot be merged across chunks",
                    name.to_ascii_uppercase()
                )));
            }
            let up = name.to_ascii_uppercase();
            if DECOMPOSABLE.contains(&up.as_str()) {
                Ok(ItemKind::PlainAggregate {
                    op: up,
                    args: args.clone(),
                })
            } else {
                Ok(ItemKind::Opaque)
            }
        }
        other if contains_aggregate(other) => Ok(ItemKind::Opaque),
        _ => Ok(ItemKind::Passthrough),
    }
}

fn decompose(
    item: &SelectItem,
    op: &str,
    args: Vec<Expr>,
    counter: &mut u32,
    parallel: &mut Vec<SelectItem>,
    fixup: &mut Vec<SelectItem>,
) {
    let fixup_alias = Some(fixup_alias_for(item));
    match op {
        "AVG" => {
            *counter += 1;
            let count_alias = format!("QS{counter}_COUNT");
            *counter += 1;
            let sum_alias = format!("QS{counter}_SUM");
            parallel.push(SelectItem {
                expr: Expr::func("COUNT", args.clone()),
                alias: Some(count_alias.clone()),
            });
            parallel.push(SelectItem {
                expr: Expr::func("SUM", args),
                alias: Some(sum_alias.clone()),
            });
            fixup.push(SelectItem {
                expr: Expr::Nested(Box::new(Expr::Binary {
                    left: Box::new(Expr::func("SUM", vec![Expr::col(sum_alias)])),
                    op: skyq_query::BinaryOp::Divide,
                    right: Box::new(Expr::func("SUM", vec![Expr::col(count_alias)])),
                })),
                alias: fixup_alias,
            });
        }
        _ => {
            *counter += 1;
            let alias = format!("QS{counter}_{op}");
            // The parallel side keeps the aggregate exactly as written.
            parallel.push(SelectItem {
                expr: item.expr.clone(),
                alias: Some(alias.clone()),
            });
            let merge_op = match op {
                "COUNT" | "SUM" => "SUM",
                other => other,
            };
            fixup.push(SelectItem {
                expr: Expr::func(merge_op, vec![Expr::col(alias)]),
                alias: fixup_alias,
            });
        }
    }
}

/// Column reference the fix-up uses for a passthrough item.
fn merge_ref(item: &SelectItem) -> Expr {
    if let Some(alias) = &item.alias {
        return Expr::col(alias.clone());
    }
    match &item.expr {
        Expr::Column { name, .. } => Expr::col(name.clone()),
        other => Expr::col(quote_ident(&other.to_sql())),
    }
}

/// Alias the fix-up result column carries so the final table matches the
/// original projection.
fn fixup_alias_for(item: &SelectItem) -> String {
    match &item.alias {
        Some(alias) => alias.clone(),
        None => quote_ident(&item.expr.to_sql()),
    }
}

fn quote_ident(text: &str) -> String {
    format!("`{}`", text.replace('`', "``"))
}
