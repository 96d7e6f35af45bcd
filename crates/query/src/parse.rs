//! SQL frontend: parse one user statement and lower it into the czar
//! statement model.
//!
//! Contract:
//! - exactly one statement must be present;
//! - only plain `SELECT` is accepted (the czar is read-only);
//! - constructs outside the supported subset surface as `Unsupported`, never
//!   as silent misinterpretation.

use skyq_common::{CzarError, Result};
use sqlparser::ast::{
    BinaryOperator as SqlBinaryOp, Distinct, DuplicateTreatment, Expr as SqlExpr, FunctionArg,
    FunctionArgExpr, FunctionArguments, GroupByExpr, Join as SqlJoin, JoinConstraint as SqlJoinConstraint,
    JoinOperator, ObjectName, Query, Select, SelectItem as SqlSelectItem, SetExpr, Statement,
    TableFactor, UnaryOperator, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::ast::{
    BinaryOp, Expr, FromClause, Join, JoinConstraint, JoinKind, Literal, OrderByItem, SelectItem,
    SelectStmt, TableRef,
};

/// Parse a SQL string into raw statements.
pub fn parse_sql(sql: &str) -> Result<Vec<Statement>> {
    let dialect = GenericDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| CzarError::Unsupported(e.to_string()))
}

/// Parse a single `SELECT` statement into the czar statement model.
pub fn parse_select(sql: &str) -> Result<SelectStmt> {
    let stmts = parse_sql(sql)?;
    if stmts.len() != 1 {
        return Err(CzarError::Unsupported(
            "exactly one statement is accepted per submission".to_string(),
        ));
    }
    match &stmts[0] {
        Statement::Query(q) => lower_query(q),
        other => Err(CzarError::Unsupported(format!(
            "only SELECT statements are accepted, got: {other}"
        ))),
    }
}

fn lower_query(q: &Query) -> Result<SelectStmt> {
    if q.with.is_some() {
        return Err(CzarError::Unsupported(
            "WITH/CTE queries are not accepted".to_string(),
        ));
    }
    let select = match &*q.body {
        SetExpr::Select(s) => s.as_ref(),
        _ => {
            return Err(CzarError::Unsupported(
                "set operations and VALUES are not accepted".to_string(),
            ))
        }
    };
    let mut stmt = lower_select(select)?;

    if let Some(order_by) = &q.order_by {
        for o in &order_by.exprs {
            stmt.order_by.push(OrderByItem {
                expr: lower_expr(&o.expr)?,
                desc: o.asc == Some(false),
            });
        }
    }
    if let Some(limit) = &q.limit {
        match limit {
            SqlExpr::Value(Value::Number(n, _)) => {
                let n = n.parse::<u64>().map_err(|e| {
                    CzarError::Unsupported(format!("invalid LIMIT literal '{n}': {e}"))
                })?;
                stmt.limit = Some(n);
            }
            other => {
                return Err(CzarError::Unsupported(format!(
                    "LIMIT must be a numeric literal, got: {other}"
                )))
            }
        }
    }
    Ok(stmt)
}

fn lower_select(s: &Select) -> Result<SelectStmt> {
    let distinct = match &s.distinct {
        None => false,
        Some(Distinct::Distinct) => true,
        Some(Distinct::On(_)) => {
            return Err(CzarError::Unsupported(
                "DISTINCT ON is not accepted".to_string(),
            ))
        }
    };

    let mut select = Vec::with_capacity(s.projection.len());
    for item in &s.projection {
        select.push(lower_select_item(item)?);
    }

    let from = lower_from(&s.from)?;
    let where_clause = s.selection.as_ref().map(lower_expr).transpose()?;

    let group_by = match &s.group_by {
        GroupByExpr::Expressions(exprs, modifiers) if modifiers.is_empty() => {
            exprs.iter().map(lower_expr).collect::<Result<Vec<_>>>()?
        }
        GroupByExpr::Expressions(..) => {
            return Err(CzarError::Unsupported(
                "GROUP BY modifiers are not accepted".to_string(),
            ))
        }
        GroupByExpr::All(_) => {
            return Err(CzarError::Unsupported(
                "GROUP BY ALL is not accepted".to_string(),
            ))
        }
    };
    let having = s.having.as_ref().map(lower_expr).transpose()?;

    Ok(SelectStmt {
        distinct,
        select,
        from,
        where_clause,
        group_by,
        having,
        order_by: vec![],
        limit: None,
    })
}

fn lower_select_item(item: &SqlSelectItem) -> Result<SelectItem> {
    match item {
        SqlSelectItem::UnnamedExpr(e) => Ok(SelectItem {
            expr: lower_expr(e)?,
            alias: None,
        }),
        SqlSelectItem::ExprWithAlias { expr, alias } => Ok(SelectItem {
            expr: lower_expr(expr)?,
            alias: Some(alias.value.clone()),
        }),
        SqlSelectItem::Wildcard(_) => Ok(SelectItem {
            expr: Expr::Wildcard,
            alias: None,
        }),
        SqlSelectItem::QualifiedWildcard(..) => Err(CzarError::Unsupported(
            "qualified wildcards are not accepted".to_string(),
        )),
    }
}

fn lower_from(from: &[sqlparser::ast::TableWithJoins]) -> Result<Option<FromClause>> {
    let mut iter = from.iter();
    let Some(first_twj) = iter.next() else {
        return Ok(None);
    };

    let first = lower_table_factor(&first_twj.relation)?;
    let mut joins = Vec::new();
    for j in &first_twj.joins {
        joins.push(lower_join(j)?);
    }
    // Comma-separated FROM elements are cross joins over the first table.
    for twj in iter {
        joins.push(Join {
            kind: JoinKind::Cross,
            table: lower_table_factor(&twj.relation)?,
            constraint: JoinConstraint::None,
        });
        for j in &twj.joins {
            joins.push(lower_join(j)?);
        }
    }
    Ok(Some(FromClause { first, joins }))
}

fn lower_join(j: &SqlJoin) -> Result<Join> {
    let table = lower_table_factor(&j.relation)?;
    let (kind, constraint) = match &j.join_operator {
        JoinOperator::Inner(c) => (JoinKind::Inner, lower_join_constraint(c)?),
        JoinOperator::LeftOuter(c) => (JoinKind::Left, lower_join_constraint(c)?),
        JoinOperator::RightOuter(c) => (JoinKind::Right, lower_join_constraint(c)?),
        JoinOperator::FullOuter(c) => (JoinKind::Full, lower_join_constraint(c)?),
        JoinOperator::CrossJoin => (JoinKind::Cross, JoinConstraint::None),
        other => {
            return Err(CzarError::Unsupported(format!(
                "join type is not accepted: {other:?}"
            )))
        }
    };
    Ok(Join {
        kind,
        table,
        constraint,
    })
}

fn lower_join_constraint(c: &SqlJoinConstraint) -> Result<JoinConstraint> {
    match c {
        SqlJoinConstraint::On(e) => Ok(JoinConstraint::On(lower_expr(e)?)),
        SqlJoinConstraint::Using(cols) => Ok(JoinConstraint::Using(
            cols.iter().map(|c| c.value.clone()).collect(),
        )),
        SqlJoinConstraint::Natural => Ok(JoinConstraint::Natural),
        SqlJoinConstraint::None => Ok(JoinConstraint::None),
    }
}

fn lower_table_factor(tf: &TableFactor) -> Result<TableRef> {
    match tf {
        TableFactor::Table { name, alias, .. } => {
            let (db, table) = object_name_parts(name)?;
            let mut r = TableRef::new(db, table);
            if let Some(alias) = alias {
                r.alias = Some(alias.name.value.clone());
            }
            Ok(r)
        }
        TableFactor::Derived { .. } => Err(CzarError::Unsupported(
            "subqueries in FROM are not accepted".to_string(),
        )),
        other => Err(CzarError::Unsupported(format!(
            "table factor is not accepted: {other}"
        ))),
    }
}

fn object_name_parts(name: &ObjectName) -> Result<(Option<String>, String)> {
    let parts: Vec<String> = name.0.iter().map(|i| i.value.clone()).collect();
    match parts.len() {
        1 => Ok((None, parts[0].clone())),
        2 => Ok((Some(parts[0].clone()), parts[1].clone())),
        _ => Err(CzarError::Unsupported(format!(
            "table name has too many qualifiers: {name}"
        ))),
    }
}

fn lower_expr(e: &SqlExpr) -> Result<Expr> {
    match e {
        SqlExpr::Identifier(id) => Ok(Expr::Column {
            qualifier: None,
            name: id.value.clone(),
        }),
        SqlExpr::CompoundIdentifier(ids) if ids.len() == 2 => Ok(Expr::Column {
            qualifier: Some(ids[0].value.clone()),
            name: ids[1].value.clone(),
        }),
        SqlExpr::CompoundIdentifier(ids) => Err(CzarError::Unsupported(format!(
            "column reference has too many qualifiers: {}",
            ids.iter()
                .map(|i| i.value.as_str())
                .collect::<Vec<_>>()
                .join(".")
        ))),
        SqlExpr::Value(v) => lower_value(v),
        SqlExpr::BinaryOp { left, op, right } => Ok(Expr::Binary {
            left: Box::new(lower_expr(left)?),
            op: lower_binary_op(op)?,
            right: Box::new(lower_expr(right)?),
        }),
        SqlExpr::UnaryOp { op, expr } => match op {
            UnaryOperator::Not => Ok(Expr::Not(Box::new(lower_expr(expr)?))),
            UnaryOperator::Minus => Ok(Expr::Neg(Box::new(lower_expr(expr)?))),
            UnaryOperator::Plus => lower_expr(expr),
            other => Err(CzarError::Unsupported(format!(
                "unary operator is not accepted: {other}"
            ))),
        },
        SqlExpr::Function(f) => lower_function(f),
        SqlExpr::IsNull(inner) => Ok(Expr::IsNull {
            expr: Box::new(lower_expr(inner)?),
            negated: false,
        }),
        SqlExpr::IsNotNull(inner) => Ok(Expr::IsNull {
            expr: Box::new(lower_expr(inner)?),
            negated: true,
        }),
        SqlExpr::InList {
            expr,
            list,
            negated,
        } => Ok(Expr::InList {
            expr: Box::new(lower_expr(expr)?),
            list: list.iter().map(lower_expr).collect::<Result<Vec<_>>>()?,
            negated: *negated,
        }),
        SqlExpr::Between {
            expr,
            negated,
            low,
            high,
        } => Ok(Expr::Between {
            expr: Box::new(lower_expr(expr)?),
            low: Box::new(lower_expr(low)?),
            high: Box::new(lower_expr(high)?),
            negated: *negated,
        }),
        SqlExpr::Nested(inner) => Ok(Expr::Nested(Box::new(lower_expr(inner)?))),
        SqlExpr::Subquery(_) | SqlExpr::InSubquery { .. } | SqlExpr::Exists { .. } => {
            Err(CzarError::Unsupported(
                "subqueries are not accepted".to_string(),
            ))
        }
        other => Err(CzarError::Unsupported(format!(
            "expression is not accepted: {other}"
        ))),
    }
}

fn lower_value(v: &Value) -> Result<Expr> {
    match v {
        Value::Number(n, _) => Ok(Expr::Literal(Literal::Number(n.clone()))),
        Value::SingleQuotedString(s) => Ok(Expr::Literal(Literal::String(s.clone()))),
        Value::Boolean(b) => Ok(Expr::Literal(Literal::Bool(*b))),
        Value::Null => Ok(Expr::Literal(Literal::Null)),
        other => Err(CzarError::Unsupported(format!(
            "literal is not accepted: {other}"
        ))),
    }
}

fn lower_binary_op(op: &SqlBinaryOp) -> Result<BinaryOp> {
    Ok(match op {
        SqlBinaryOp::Plus => BinaryOp::Plus,
        SqlBinaryOp::Minus => BinaryOp::Minus,
        SqlBinaryOp::Multiply => BinaryOp::Multiply,
        SqlBinaryOp::Divide => BinaryOp::Divide,
        SqlBinaryOp::Modulo => BinaryOp::Modulo,
        SqlBinaryOp::Eq => BinaryOp::Eq,
        SqlBinaryOp::NotEq => BinaryOp::NotEq,
        SqlBinaryOp::Lt => BinaryOp::Lt,
        SqlBinaryOp::LtEq => BinaryOp::LtEq,
        SqlBinaryOp::Gt => BinaryOp::Gt,
        SqlBinaryOp::GtEq => BinaryOp::GtEq,
        SqlBinaryOp::And => BinaryOp::And,
        SqlBinaryOp::Or => BinaryOp::Or,
        other => {
            return Err(CzarError::Unsupported(format!(
                "binary operator is not accepted: {other}"
            )))
        }
    })
}

fn lower_function(f: &sqlparser::ast::Function) -> Result<Expr> {
    let name = f
        .name
        .0
        .iter()
        .map(|i| i.value.clone())
        .collect::<Vec<_>>()
        .join(".");
    let (distinct, args) = match &f.args {
        FunctionArguments::None => (false, vec![]),
        FunctionArguments::List(list) => {
            let distinct = matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct));
            let mut args = Vec::with_capacity(list.args.len());
            for a in &list.args {
                match a {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => args.push(lower_expr(e)?),
                    FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => args.push(Expr::Wildcard),
                    other => {
                        return Err(CzarError::Unsupported(format!(
                            "function argument is not accepted: {other}"
                        )))
                    }
                }
            }
            (distinct, args)
        }
        FunctionArguments::Subquery(_) => {
            return Err(CzarError::Unsupported(
                "subquery function arguments are not accepted".to_string(),
            ))
        }
    };
    Ok(Expr::Func {
        name,
        distinct,
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::parse_select;
    use crate::ast::{Expr, JoinConstraint, JoinKind};
    use crate::template::TemplateMapping;
    use skyq_common::CzarError;

    #[test]
    fn round_trips_simple_select() {
        let stmt = parse_select("SELECT mag FROM Object WHERE mag > 20.0").unwrap();
        let sql = stmt
            .to_template()
            .render(&TemplateMapping::default())
            .unwrap();
        assert_eq!(sql, "SELECT mag FROM Object WHERE mag>20.0");
    }

    #[test]
    fn lowers_count_star_and_group_by() {
        let stmt =
            parse_select("SELECT chunkId, COUNT(*) FROM LSST.Object GROUP BY chunkId").unwrap();
        assert_eq!(stmt.select.len(), 2);
        assert!(matches!(
            &stmt.select[1].expr,
            Expr::Func { name, args, .. } if name == "COUNT" && matches!(args[0], Expr::Wildcard)
        ));
        assert_eq!(stmt.group_by.len(), 1);
        let from = stmt.from.as_ref().unwrap();
        assert_eq!(from.first.db.as_deref(), Some("LSST"));
    }

    #[test]
    fn lowers_joins() {
        let stmt = parse_select(
            "SELECT o.ra FROM Object o JOIN Source s ON o.objectId = s.objectId",
        )
        .unwrap();
        let from = stmt.from.as_ref().unwrap();
        assert_eq!(from.joins.len(), 1);
        assert_eq!(from.joins[0].kind, JoinKind::Inner);
        assert!(matches!(from.joins[0].constraint, JoinConstraint::On(_)));
        assert_eq!(from.first.binding_name(), "o");
    }

    #[test]
    fn rejects_multi_statement_and_non_select() {
        assert!(matches!(
            parse_select("SELECT 1; SELECT 2"),
            Err(CzarError::Unsupported(_))
        ));
        assert!(matches!(
            parse_select("DROP TABLE Object"),
            Err(CzarError::Unsupported(_))
        ));
    }

    #[test]
    fn rejects_subqueries() {
        assert!(matches!(
            parse_select("SELECT a FROM t WHERE a IN (SELECT b FROM u)"),
            Err(CzarError::Unsupported(_))
        ));
        assert!(matches!(
            parse_select("SELECT a FROM (SELECT b FROM u) x"),
            Err(CzarError::Unsupported(_))
        ));
    }

    #[test]
    fn keeps_order_by_and_limit() {
        let stmt = parse_select("SELECT mag FROM Object ORDER BY mag DESC LIMIT 10").unwrap();
        assert_eq!(stmt.order_by.len(), 1);
        assert!(stmt.order_by[0].desc);
        assert_eq!(stmt.limit, Some(10));
    }
}
