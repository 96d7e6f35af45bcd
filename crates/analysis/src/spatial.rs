//! Spatial predicate extraction.
//!
//! Recognized restrictors are `qserv_areaspec_box`, `qserv_areaspec_circle`,
//! `qserv_areaspec_ellipse` and `qserv_areaspec_poly` appearing as top-level
//! AND conjuncts of WHERE. They are pulled out of the statement (workers do
//! not evaluate them) and normalized into a [`Region`]. Explicit `chunkId`
//! equality/IN filters pin the chunk set directly and stay in the statement,
//! since `chunkId` is a real column on worker tables.

use skyq_common::{ChunkId, CzarError, Result};
use skyq_geom::Region;
use skyq_query::{BinaryOp, Expr, Literal, SelectStmt};

/// Normalized spatial constraint of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpatialConstraint {
    /// Restrictor region, when present. Missing region means full scan.
    pub region: Option<Region>,
    /// Chunks pinned by explicit `chunkId` predicates.
    pub explicit_chunks: Vec<ChunkId>,
}

/// Extract the spatial constraint from WHERE, removing restrictor calls.
pub fn extract(stmt: &mut SelectStmt) -> Result<SpatialConstraint> {
    let Some(where_clause) = stmt.where_clause.take() else {
        return Ok(SpatialConstraint::default());
    };

    let mut conjuncts = Vec::new();
    flatten_and(where_clause, &mut conjuncts);

    let mut constraint = SpatialConstraint::default();
    let mut kept = Vec::new();
    for conjunct in conjuncts {
        if let Some(region) = try_restrictor(&conjunct)? {
            if constraint.region.is_some() {
                return Err(CzarError::Unsupported(
                    "more than one spatial restrictor in WHERE".to_string(),
                ));
            }
            constraint.region = Some(region);
            continue;
        }
        collect_explicit_chunks(&conjunct, &mut constraint.explicit_chunks);
        kept.push(conjunct);
    }

    stmt.where_clause = rebuild_and(kept);
    Ok(constraint)
}

fn flatten_and(expr: Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::Binary {
            left,
            op: BinaryOp::And,
            right,
        } => {
            flatten_and(*left, out);
            flatten_and(*right, out);
        }
        Expr::Nested(inner) => flatten_and(*inner, out),
        other => out.push(other),
    }
}

fn rebuild_and(conjuncts: Vec<Expr>) -> Option<Expr> {
    conjuncts.into_iter().reduce(|acc, e| Expr::Binary {
        left: Box::new(acc),
        op: BinaryOp::And,
        right: Box::new(e),
    })
}

fn try_restrictor(expr: &Expr) -> Result<Option<Region>> {
    let Expr::Func { name, args, .. } = expr else {
        return Ok(None);
    };
    let lowered = name.to_ascii_lowercase();
    let builder: fn(&[f64]) -> Result<Region> = match lowered.as_str() {
        "qserv_areaspec_box" => Region::box_from_params,
        "qserv_areaspec_circle" => Region::circle_from_params,
        "qserv_areaspec_ellipse" => Region::ellipse_from_params,
        "qserv_areaspec_poly" => Region::polygon_from_params,
        _ => return Ok(None),
    };
    let mut params = Vec::with_capacity(args.len());
    for a in args {
        params.push(numeric_literal(a).ok_or_else(|| {
            CzarError::Unsupported(format!(
                "spatial restrictor {name} takes numeric literal arguments only"
            ))
        })?);
    }
    builder(&params).map(Some)
}

fn numeric_literal(expr: &Expr) -> Option<f64> {
    match expr {
        Expr::Literal(Literal::Number(n)) => n.parse().ok(),
        Expr::Neg(inner) => numeric_literal(inner).map(|v| -v),
        Expr::Nested(inner) => numeric_literal(inner),
        _ => None,
    }
}

fn collect_explicit_chunks(expr: &Expr, out: &mut Vec<ChunkId>) {
    match expr {
        Expr::Binary {
            left,
            op: BinaryOp::Eq,
            right,
        } => {
            if is_chunk_column(left) {
                if let Some(v) = numeric_literal(right) {
                    push_chunk(out, v);
                }
            } else if is_chunk_column(right) {
                if let Some(v) = numeric_literal(left) {
                    push_chunk(out, v);
                }
            }
        }
        Expr::InList {
            expr,
            list,
            negated: false,
        } if is_chunk_column(expr) => {
            for e in list {
                if let Some(v) = numeric_literal(e) {
                    push_chunk(out, v);
                }
            }
        }
        _ => {}
    }
}

fn is_chunk_column(expr: &Expr) -> bool {
    matches!(expr, Expr::Column { name, .. } if name.eq_ignore_ascii_case("chunkId"))
}

fn push_chunk(out: &mut Vec<ChunkId>, v: f64) {
    if v >= 0.0 && v.fract() == 0.0 {
        out.push(ChunkId(v as u32));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyq_query::parse_select;
    use skyq_query::TemplateMapping;

    #[test]
    fn extracts_box_and_strips_it_from_where() {
        let mut stmt = parse_select(
            "SELECT ra FROM Object WHERE qserv_areaspec_box(0, 0, 1, 1) AND mag < 20",
        )
        .unwrap();
        let c = extract(&mut stmt).unwrap();
        assert_eq!(
            c.region,
            Some(Region::Box {
                lon1: 0.0,
                lat1: 0.0,
                lon2: 1.0,
                lat2: 1.0
            })
        );
        let sql = stmt
            .to_template()
            .render(&TemplateMapping::default())
            .unwrap();
        assert_eq!(sql, "SELECT ra FROM Object WHERE mag<20");
    }

    #[test]
    fn restrictor_alone_clears_where() {
        let mut stmt =
            parse_select("SELECT ra FROM Object WHERE qserv_areaspec_circle(10, -5, 0.5)").unwrap();
        let c = extract(&mut stmt).unwrap();
        assert!(matches!(c.region, Some(Region::Circle { .. })));
        assert!(stmt.where_clause.is_none());
    }

    #[test]
    fn missing_region_means_full_scan() {
        let mut stmt = parse_select("SELECT ra FROM Object WHERE mag < 20").unwrap();
        let c = extract(&mut stmt).unwrap();
        assert!(c.region.is_none());
        assert!(c.explicit_chunks.is_empty());
        assert!(stmt.where_clause.is_some());
    }

    #[test]
    fn bad_arity_is_user_visible() {
        let mut stmt =
            parse_select("SELECT ra FROM Object WHERE qserv_areaspec_box(0, 0, 1)").unwrap();
        assert!(matches!(
            extract(&mut stmt),
            Err(CzarError::Unsupported(_))
        ));
    }

    #[test]
    fn two_restrictors_are_rejected() {
        let mut stmt = parse_select(
            "SELECT ra FROM Object WHERE qserv_areaspec_box(0,0,1,1) AND qserv_areaspec_circle(0,0,1)",
        )
        .unwrap();
        assert!(matches!(
            extract(&mut stmt),
            Err(CzarError::Unsupported(_))
        ));
    }

    #[test]
    fn explicit_chunk_filters_pin_chunks_and_stay() {
        let mut stmt =
            parse_select("SELECT ra FROM Object WHERE chunkId IN (100, 101) AND mag < 20").unwrap();
        let c = extract(&mut stmt).unwrap();
        assert_eq!(c.explicit_chunks, vec![ChunkId(100), ChunkId(101)]);
        let sql = stmt
            .to_template()
            .render(&TemplateMapping::default())
            .unwrap();
        assert!(sql.contains("chunkId IN (100,101)"));
    }
}
