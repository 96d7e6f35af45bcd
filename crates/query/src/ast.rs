//! Czar-owned SQL statement model.
//!
//! Parsed statements are lowered into this representation once; every later
//! pass rewrites these nodes in place and renders them into a
//! [`QueryTemplate`] without textual reparsing. Nodes are tagged variants,
//! deep copy is structural (`Clone`), and rewrites use the `walk_*` visitors.

use serde::{Deserialize, Serialize};

use crate::template::{ChunkTarget, QueryTemplate, TemplateEntry};

/// Literal values appearing in expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    /// Numeric literal kept in its source spelling.
    Number(String),
    /// Single-quoted string literal (unescaped value).
    String(String),
    /// Boolean literal.
    Bool(bool),
    /// NULL literal.
    Null,
}

/// Binary operators preserved by the rewriter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Multiply,
    /// `/`
    Divide,
    /// `%`
    Modulo,
    /// `=`
    Eq,
    /// `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `AND`
    And,
    /// `OR`
    Or,
}

impl BinaryOp {
    fn sql(&self) -> &'static str {
        match self {
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => " AND ",
            BinaryOp::Or => " OR ",
        }
    }
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Column reference, optionally qualified by table or alias.
    Column {
        /// Table name or alias.
        qualifier: Option<String>,
        /// Column name.
        name: String,
    },
    /// Literal value.
    Literal(Literal),
    /// `*` in a select list or `COUNT(*)`.
    Wildcard,
    /// Binary operation.
    Binary {
        /// Left operand.
        left: Box<Expr>,
        /// Operator.
        op: BinaryOp,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Logical negation.
    Not(Box<Expr>),
    /// Arithmetic negation.
    Neg(Box<Expr>),
    /// Function call (scalar or aggregate; classification happens later).
    Func {
        /// Function name in source spelling.
        name: String,
        /// `DISTINCT` inside the call.
        distinct: bool,
        /// Argument expressions.
        args: Vec<Expr>,
    },
    /// `IS [NOT] NULL`.
    IsNull {
        /// Tested expression.
        expr: Box<Expr>,
        /// `IS NOT NULL` when true.
        negated: bool,
    },
    /// `[NOT] IN (list)`.
    InList {
        /// Tested expression.
        expr: Box<Expr>,
        /// Candidate list.
        list: Vec<Expr>,
        /// `NOT IN` when true.
        negated: bool,
    },
    /// `[NOT] BETWEEN low AND high`.
    Between {
        /// Tested expression.
        expr: Box<Expr>,
        /// Lower bound.
        low: Box<Expr>,
        /// Upper bound.
        high: Box<Expr>,
        /// `NOT BETWEEN` when true.
        negated: bool,
    },
    /// Parenthesized sub-expression.
    Nested(Box<Expr>),
}

impl Expr {
    /// Shorthand for an unqualified column reference.
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column {
            qualifier: None,
            name: name.into(),
        }
    }

    /// Shorthand for a function call.
    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Func {
            name: name.into(),
            distinct: false,
            args,
        }
    }

    /// Pre-order mutable traversal.
    pub fn walk_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        f(self);
        match self {
            Expr::Binary { left, right, .. } => {
                left.walk_mut(f);
                right.walk_mut(f);
            }
            Expr::Not(e) | Expr::Neg(e) | Expr::Nested(e) => e.walk_mut(f),
            Expr::Func { args, .. } => {
                for a in args {
                    a.walk_mut(f);
                }
            }
            Expr::IsNull { expr, .. } => expr.walk_mut(f),
            Expr::InList { expr, list, .. } => {
                expr.walk_mut(f);
                for e in list {
                    e.walk_mut(f);
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.walk_mut(f);
                low.walk_mut(f);
                high.walk_mut(f);
            }
            Expr::Column { .. } | Expr::Literal(_) | Expr::Wildcard => {}
        }
    }

    /// Pre-order immutable traversal.
    pub fn walk(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Binary { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::Not(e) | Expr::Neg(e) | Expr::Nested(e) => e.walk(f),
            Expr::Func { args, .. } => {
                for a in args {
                    a.walk(f);
                }
            }
            Expr::IsNull { expr, .. } => expr.walk(f),
            Expr::InList { expr, list, .. } => {
                expr.walk(f);
                for e in list {
                    e.walk(f);
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.walk(f);
                low.walk(f);
                high.walk(f);
            }
            Expr::Column { .. } | Expr::Literal(_) | Expr::Wildcard => {}
        }
    }

    /// Render this expression into a template.
    pub fn write_sql(&self, t: &mut QueryTemplate) {
        match self {
            Expr::Column { qualifier, name } => {
                if let Some(q) = qualifier {
                    t.push_literal(q);
                    t.push_literal(".");
                }
                t.push_literal(name);
            }
            Expr::Literal(Literal::Number(n)) => t.push_literal(n),
            Expr::Literal(Literal::String(s)) => {
                t.push_literal("'");
                t.push_literal(&s.replace('\'', "''"));
                t.push_literal("'");
            }
            Expr::Literal(Literal::Bool(b)) => {
                t.push_literal(if *b { "TRUE" } else { "FALSE" })
            }
            Expr::Literal(Literal::Null) => t.push_literal("NULL"),
            Expr::Wildcard => t.push_literal("*"),
            Expr::Binary { left, op, right } => {
                left.write_sql(t);
                t.push_literal(op.sql());
                right.write_sql(t);
            }
            Expr::Not(e) => {
                t.push_literal("NOT ");
                e.write_sql(t);
            }
            Expr::Neg(e) => {
                t.push_literal("-");
                e.write_sql(t);
            }
            Expr::Func {
                name,
                distinct,
                args,
            } => {
                t.push_literal(name);
                t.push_literal("(");
                if *distinct {
                    t.push_literal("DISTINCT ");
                }
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        t.push_literal(",");
                    }
                    a.write_sql(t);
                }
                t.push_literal(")");
            }
            Expr::IsNull { expr, negated } => {
                expr.write_sql(t);
                t.push_literal(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                expr.write_sql(t);
                t.push_literal(if *negated { " NOT IN (" } else { " IN (" });
                for (i, e) in list.iter().enumerate() {
                    if i > 0 {
                        t.push_literal(",");
                    }
                    e.write_sql(t);
                }
                t.push_literal(")");
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                expr.write_sql(t);
                t.push_literal(if *negated {
                    " NOT BETWEEN "
                } else {
                    " BETWEEN "
                });
                low.write_sql(t);
                t.push_literal(" AND ");
                high.write_sql(t);
            }
            Expr::Nested(e) => {
                t.push_literal("(");
                e.write_sql(t);
                t.push_literal(")");
            }
        }
    }

    /// Render to a plain SQL string (no placeholders expected).
    pub fn to_sql(&self) -> String {
        let mut t = QueryTemplate::new();
        self.write_sql(&mut t);
        t.render(&crate::template::TemplateMapping::default())
            .expect("expression rendering uses no placeholders")
    }
}

/// One select-list item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectItem {
    /// Projected expression.
    pub expr: Expr,
    /// `AS` alias, if any.
    pub alias: Option<String>,
}

impl SelectItem {
    fn write_sql(&self, t: &mut QueryTemplate) {
        self.expr.write_sql(t);
        if let Some(alias) = &self.alias {
            t.push_literal(" AS ");
            t.push_literal(alias);
        }
    }
}

/// One table reference in FROM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRef {
    /// Database qualifier as written, if any.
    pub db: Option<String>,
    /// Table name.
    pub table: String,
    /// User or generated alias.
    pub alias: Option<String>,
    /// Per-chunk rewrite mode, assigned during analysis.
    pub chunking: ChunkTarget,
}

impl TableRef {
    /// A bare reference with no alias and no chunk rewrite.
    pub fn new(db: Option<String>, table: impl Into<String>) -> Self {
        Self {
            db,
            table: table.into(),
            alias: None,
            chunking: ChunkTarget::None,
        }
    }

    /// Name other statements use to reference this table's columns.
    pub fn binding_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    fn write_sql(&self, t: &mut QueryTemplate) {
        match self.chunking {
            ChunkTarget::None => {
                if let Some(db) = &self.db {
                    t.push_literal(db);
                    t.push_literal(".");
                }
                t.push_literal(&self.table);
            }
            chunking => t.push(TemplateEntry::Table {
                db: self.db.clone(),
                name: self.table.clone(),
                chunking,
            }),
        }
        if let Some(alias) = &self.alias {
            t.push_literal(" AS ");
            t.push_literal(alias);
        }
    }
}

/// Join kinds preserved from the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    /// `[INNER] JOIN`
    Inner,
    /// `LEFT [OUTER] JOIN`
    Left,
    /// `RIGHT [OUTER] JOIN`
    Right,
    /// `FULL [OUTER] JOIN`
    Full,
    /// `CROSS JOIN` / comma join
    Cross,
}

impl JoinKind {
    fn sql(&self) -> &'static str {
        match self {
            JoinKind::Inner => " JOIN ",
            JoinKind::Left => " LEFT JOIN ",
            JoinKind::Right => " RIGHT JOIN ",
            JoinKind::Full => " FULL JOIN ",
            JoinKind::Cross => " CROSS JOIN ",
        }
    }
}

/// Join constraints preserved from the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JoinConstraint {
    /// `NATURAL` join (expanded to ON during analysis).
    Natural,
    /// `ON <expr>`.
    On(Expr),
    /// `USING (cols)`.
    Using(Vec<String>),
    /// No constraint (cross join).
    None,
}

/// One joined table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    /// Join kind.
    pub kind: JoinKind,
    /// Right-hand table.
    pub table: TableRef,
    /// Join constraint.
    pub constraint: JoinConstraint,
}

/// FROM clause: a first table plus zero or more joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FromClause {
    /// Leading table reference.
    pub first: TableRef,
    /// Remaining joined tables, in source order.
    pub joins: Vec<Join>,
}

impl FromClause {
    /// All table references in source order.
    pub fn tables(&self) -> impl Iterator<Item = &TableRef> {
        std::iter::once(&self.first).chain(self.joins.iter().map(|j| &j.table))
    }

    /// All table references, mutably, in source order.
    pub fn tables_mut(&mut self) -> impl Iterator<Item = &mut TableRef> {
        std::iter::once(&mut self.first).chain(self.joins.iter_mut().map(|j| &mut j.table))
    }
}

/// Sort key in ORDER BY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderByItem {
    /// Sort expression.
    pub expr: Expr,
    /// Descending order when true.
    pub desc: bool,
}

impl OrderByItem {
    fn write_sql(&self, t: &mut QueryTemplate) {
        self.expr.write_sql(t);
        if self.desc {
            t.push_literal(" DESC");
        }
    }
}

/// A parsed, rewritable SELECT statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectStmt {
    /// `DISTINCT` flag.
    pub distinct: bool,
    /// Select list.
    pub select: Vec<SelectItem>,
    /// FROM clause; `None` only for table-free selects.
    pub from: Option<FromClause>,
    /// WHERE predicate.
    pub where_clause: Option<Expr>,
    /// GROUP BY keys.
    pub group_by: Vec<Expr>,
    /// HAVING predicate.
    pub having: Option<Expr>,
    /// ORDER BY keys.
    pub order_by: Vec<OrderByItem>,
    /// LIMIT row count.
    pub limit: Option<u64>,
}

impl SelectStmt {
    /// Visit every expression in the statement mutably (select list, WHERE,
    /// GROUP BY, HAVING, ORDER BY, join constraints).
    pub fn walk_exprs_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        for item in &mut self.select {
            item.expr.walk_mut(f);
        }
        if let Some(from) = &mut self.from {
            for join in &mut from.joins {
                if let JoinConstraint::On(e) = &mut join.constraint {
                    e.walk_mut(f);
                }
            }
        }
        if let Some(w) = &mut self.where_clause {
            w.walk_mut(f);
        }
        for g in &mut self.group_by {
            g.walk_mut(f);
        }
        if let Some(h) = &mut self.having {
            h.walk_mut(f);
        }
        for o in &mut self.order_by {
            o.expr.walk_mut(f);
        }
    }

    /// Render the statement into a template.
    pub fn to_template(&self) -> QueryTemplate {
        let mut t = QueryTemplate::new();
        t.push_literal("SELECT ");
        if self.distinct {
            t.push_literal("DISTINCT ");
        }
        for (i, item) in self.select.iter().enumerate() {
            if i > 0 {
                t.push_literal(",");
            }
            item.write_sql(&mut t);
        }
        if let Some(from) = &self.from {
            t.push_literal(" FROM ");
            from.first.write_sql(&mut t);
            for join in &from.joins {
                match &join.constraint {
                    JoinConstraint::Natural => {
                        t.push_literal(" NATURAL");
                        t.push_literal(join.kind.sql());
                        join.table.write_sql(&mut t);
                    }
                    JoinConstraint::On(on) => {
                        t.push_literal(join.kind.sql());
                        join.table.write_sql(&mut t);
                        t.push_literal(" ON ");
                        on.write_sql(&mut t);
                    }
                    JoinConstraint::Using(cols) => {
                        t.push_literal(join.kind.sql());
                        join.table.write_sql(&mut t);
                        t.push_literal(" USING (");
                        t.push_literal(&cols.join(","));
                        t.push_literal(")");
                    }
                    JoinConstraint::None => {
                        t.push_literal(join.kind.sql());
                        join.table.write_sql(&mut t);
                    }
                }
            }
        }
        if let Some(w) = &self.where_clause {
            t.push_literal(" WHERE ");
            w.write_sql(&mut t);
        }
        if !self.group_by.is_empty() {
            t.push_literal(" GROUP BY ");
            for (i, g) in self.group_by.iter().enumerate() {
                if i > 0 {
                    t.push_literal(",");
                }
                g.write_sql(&mut t);
            }
        }
        if let Some(h) = &self.having {
            t.push_literal(" HAVING ");
            h.write_sql(&mut t);
        }
        if !self.order_by.is_empty() {
            t.push_literal(" ORDER BY ");
            for (i, o) in self.order_by.iter().enumerate() {
                if i > 0 {
                    t.push_literal(",");
                }
                o.write_sql(&mut t);
            }
        }
        if let Some(limit) = self.limit {
            t.push_literal(" LIMIT ");
            t.push_literal(limit.to_string());
        }
        t
    }
}
