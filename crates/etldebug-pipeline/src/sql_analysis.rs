//! Structural facts about a pipeline's transform statement.
//!
//! Extracts, from `INSERT INTO .. SELECT ..` (or a bare `SELECT`):
//! - the target table and its insert column list
//! - source tables (FROM / JOIN) with their aliases
//! - equality join keys from `ON` / `USING` / implicit `WHERE a.x = b.y`
//! - destination column -> source column mappings for simple projections
//!
//! The SQLite dialect of `sqlparser` is tried first. When the statement does
//! not parse, a regex pass recovers tables and `ON a.x = b.y` keys.

use regex::Regex;
use serde::Serialize;
use sqlparser::ast::{
    BinaryOperator, Expr, Join, JoinConstraint, JoinOperator, Query, SelectItem, SetExpr,
    Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnRef {
    /// Resolved table name (aliases already replaced), when known.
    pub table: Option<String>,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinKey {
    pub left: ColumnRef,
    pub right: ColumnRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnMapping {
    pub dest_column: String,
    pub source: ColumnRef,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransformShape {
    pub target_table: Option<String>,
    pub insert_columns: Vec<String>,
    pub source_tables: Vec<TableRef>,
    pub join_keys: Vec<JoinKey>,
    pub column_mappings: Vec<ColumnMapping>,
    /// True when the shape came from the regex pass rather than the parser.
    pub heuristic: bool,
}

impl TransformShape {
    pub fn source_table_names(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for t in &self.source_tables {
            if !out.iter().any(|n| n.eq_ignore_ascii_case(&t.name)) {
                out.push(t.name.clone());
            }
        }
        out
    }

    fn resolve_table(&self, qualifier: &str) -> String {
        self.source_tables
            .iter()
            .find(|t| {
                t.alias
                    .as_deref()
                    .is_some_and(|a| a.eq_ignore_ascii_case(qualifier))
            })
            .or_else(|| {
                self.source_tables
                    .iter()
                    .find(|t| t.name.eq_ignore_ascii_case(qualifier))
            })
            .map(|t| t.name.clone())
            .unwrap_or_else(|| qualifier.to_string())
    }

    fn column_ref(&self, expr: &Expr) -> Option<ColumnRef> {
        match expr {
            Expr::Identifier(ident) => Some(ColumnRef {
                table: (self.source_tables.len() == 1).then(|| self.source_tables[0].name.clone()),
                column: ident.value.clone(),
            }),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let qualifier = &parts[parts.len() - 2].value;
                Some(ColumnRef {
                    table: Some(self.resolve_table(qualifier)),
                    column: parts[parts.len() - 1].value.clone(),
                })
            }
            Expr::Nested(inner) => self.column_ref(inner),
            Expr::Cast { expr, .. } => self.column_ref(expr),
            _ => None,
        }
    }
}

/// Analyze a transform statement. Never fails: unparseable SQL falls back to
/// the regex pass, which may return an empty shape.
pub fn analyze_transform(sql: &str) -> TransformShape {
    let dialect = SQLiteDialect {};
    match Parser::parse_sql(&dialect, sql) {
        Ok(statements) => {
            let mut shape = TransformShape::default();
            for stmt in statements {
                walk_statement(stmt, &mut shape);
            }
            if shape.source_tables.is_empty() && shape.target_table.is_none() {
                return heuristic_shape(sql);
            }
            shape
        }
        Err(err) => {
            tracing::debug!(error = %err, "transform SQL did not parse; using regex analysis");
            heuristic_shape(sql)
        }
    }
}

fn walk_statement(stmt: Statement, shape: &mut TransformShape) {
    match stmt {
        Statement::Insert {
            table_name,
            columns,
            source,
            ..
        } => {
            shape.target_table = Some(table_name.to_string());
            shape.insert_columns = columns.iter().map(|c| c.value.clone()).collect();
            let source: Option<Box<Query>> = source.into();
            if let Some(query) = source {
                walk_query(&query, shape);
            }
        }
        Statement::Query(query) => walk_query(&query, shape),
        _ => {}
    }
}

fn walk_query(query: &Query, shape: &mut TransformShape) {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return;
    };

    for twj in &select.from {
        collect_tables(twj, shape);
    }
    for twj in &select.from {
        for join in &twj.joins {
            collect_join_keys(join, shape);
        }
    }
    if select.from.len() > 1 {
        if let Some(selection) = &select.selection {
            collect_equalities(selection, shape);
        }
    }

    for (idx, item) in select.projection.iter().enumerate() {
        let (expr, alias) = match item {
            SelectItem::UnnamedExpr(expr) => (expr, None),
            SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.clone())),
            _ => continue,
        };
        let Some(source) = shape.column_ref(expr) else {
            continue;
        };
        let dest_column = shape
            .insert_columns
            .get(idx)
            .cloned()
            .or(alias)
            .unwrap_or_else(|| source.column.clone());
        shape.column_mappings.push(ColumnMapping {
            dest_column,
            source,
        });
    }
}

fn collect_tables(twj: &TableWithJoins, shape: &mut TransformShape) {
    push_table(&twj.relation, shape);
    for join in &twj.joins {
        push_table(&join.relation, shape);
    }
}

fn push_table(factor: &TableFactor, shape: &mut TransformShape) {
    match factor {
        TableFactor::Table { name, alias, .. } => shape.source_tables.push(TableRef {
            name: name.to_string(),
            alias: alias.as_ref().map(|a| a.name.value.clone()),
        }),
        TableFactor::Derived { subquery, .. } => {
            if let SetExpr::Select(inner) = subquery.body.as_ref() {
                for twj in &inner.from {
                    collect_tables(twj, shape);
                }
            }
        }
        _ => {}
    }
}

fn collect_join_keys(join: &Join, shape: &mut TransformShape) {
    let constraint = match &join.join_operator {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c) => c,
        _ => return,
    };
    match constraint {
        JoinConstraint::On(expr) => collect_equalities(expr, shape),
        JoinConstraint::Using(idents) => {
            let right_table = match &join.relation {
                TableFactor::Table { name, .. } => Some(name.to_string()),
                _ => None,
            };
            let left_table = shape.source_tables.first().map(|t| t.name.clone());
            for ident in idents {
                shape.join_keys.push(JoinKey {
                    left: ColumnRef {
                        table: left_table.clone(),
                        column: ident.value.clone(),
                    },
                    right: ColumnRef {
                        table: right_table.clone(),
                        column: ident.value.clone(),
                    },
                });
            }
        }
        _ => {}
    }
}

fn collect_equalities(expr: &Expr, shape: &mut TransformShape) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, shape);
            collect_equalities(right, shape);
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            if let (Some(l), Some(r)) = (shape.column_ref(left), shape.column_ref(right)) {
                if l.table != r.table {
                    shape.join_keys.push(JoinKey { left: l, right: r });
                }
            }
        }
        Expr::Nested(inner) => collect_equalities(inner, shape),
        _ => {}
    }
}

// ============================================================================
// Regex fallback
// ============================================================================

const NOT_AN_ALIAS: &[&str] = &[
    "on", "join", "left", "right", "inner", "outer", "full", "cross", "where", "group", "order",
    "limit", "union", "having", "using", "natural", "as", "select", "set", "values",
];

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn heuristic_shape(sql: &str) -> TransformShape {
    static TARGET: OnceLock<Option<Regex>> = OnceLock::new();
    static TABLE: OnceLock<Option<Regex>> = OnceLock::new();
    static ON_EQ: OnceLock<Option<Regex>> = OnceLock::new();

    let mut shape = TransformShape {
        heuristic: true,
        ..Default::default()
    };

    if let Some(re) = cached(
        &TARGET,
        r"(?i)\binsert\s+(?:or\s+\w+\s+)?into\s+([A-Za-z_][A-Za-z0-9_]*)",
    ) {
        shape.target_table = re.captures(sql).map(|c| c[1].to_string());
    }

    if let Some(re) = cached(
        &TABLE,
        r"(?i)\b(?:from|join)\s+([A-Za-z_][A-Za-z0-9_]*)(?:\s+(?:as\s+)?([A-Za-z_][A-Za-z0-9_]*))?",
    ) {
        for caps in re.captures_iter(sql) {
            let alias = caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .filter(|a| !NOT_AN_ALIAS.contains(&a.to_ascii_lowercase().as_str()));
            shape.source_tables.push(TableRef {
                name: caps[1].to_string(),
                alias,
            });
        }
    }

    if let Some(re) = cached(
        &ON_EQ,
        r"(?i)\b(?:on|and|where)\s+([A-Za-z_]\w*)\.([A-Za-z_]\w*)\s*=\s*([A-Za-z_]\w*)\.([A-Za-z_]\w*)",
    ) {
        let keys: Vec<JoinKey> = re
            .captures_iter(sql)
            .map(|caps| JoinKey {
                left: ColumnRef {
                    table: Some(shape.resolve_table(&caps[1])),
                    column: caps[2].to_string(),
                },
                right: ColumnRef {
                    table: Some(shape.resolve_table(&caps[3])),
                    column: caps[4].to_string(),
                },
            })
            .collect();
        shape.join_keys = keys;
    }

    shape
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_select_with_aliased_join() {
        let sql = "INSERT INTO fact_orders (order_id, customer_name, amount)
                   SELECT o.order_id, c.name, o.amount
                   FROM orders o
                   JOIN customers AS c ON o.customer_id = c.id";
        let shape = analyze_transform(sql);
        assert!(!shape.heuristic);
        assert_eq!(shape.target_table.as_deref(), Some("fact_orders"));
        assert_eq!(shape.source_table_names(), vec!["orders", "customers"]);
        assert_eq!(shape.join_keys.len(), 1);
        let key = &shape.join_keys[0];
        assert_eq!(key.left.table.as_deref(), Some("orders"));
        assert_eq!(key.left.column, "customer_id");
        assert_eq!(key.right.table.as_deref(), Some("customers"));
        assert_eq!(key.right.column, "id");
        assert_eq!(shape.column_mappings[1].dest_column, "customer_name");
        assert_eq!(shape.column_mappings[1].source.column, "name");
    }

    #[test]
    fn single_table_columns_resolve_to_that_table() {
        let shape = analyze_transform(
            "INSERT INTO stg_sales (order_id, amount) SELECT order_id, total_amount FROM source_data",
        );
        assert_eq!(shape.insert_columns, vec!["order_id", "amount"]);
        let m = &shape.column_mappings[1];
        assert_eq!(m.dest_column, "amount");
        assert_eq!(m.source.table.as_deref(), Some("source_data"));
        assert_eq!(m.source.column, "total_amount");
        assert!(shape.join_keys.is_empty());
    }

    #[test]
    fn implicit_join_in_where_clause() {
        let shape = analyze_transform("SELECT * FROM a, b WHERE a.k = b.k AND a.v > 1");
        assert_eq!(shape.join_keys.len(), 1);
        assert_eq!(shape.join_keys[0].right.table.as_deref(), Some("b"));
    }

    #[test]
    fn using_clause_produces_keys() {
        let shape = analyze_transform("SELECT * FROM a JOIN b USING (id)");
        assert_eq!(shape.join_keys.len(), 1);
        assert_eq!(shape.join_keys[0].left.table.as_deref(), Some("a"));
        assert_eq!(shape.join_keys[0].right.table.as_deref(), Some("b"));
    }

    #[test]
    fn unparseable_sql_uses_regex_fallback() {
        let sql = "INSERT INTO out SELECT o.x FROM orders o LEFT JOIN cust c ON o.cid = c.id WHERE (((";
        let shape = analyze_transform(sql);
        assert!(shape.heuristic);
        assert_eq!(shape.target_table.as_deref(), Some("out"));
        assert_eq!(shape.source_table_names(), vec!["orders", "cust"]);
        assert_eq!(shape.join_keys.len(), 1);
        assert_eq!(shape.join_keys[0].left.table.as_deref(), Some("orders"));
        assert_eq!(shape.join_keys[0].right.table.as_deref(), Some("cust"));
    }

    #[test]
    fn fallback_ignores_keywords_as_aliases() {
        let shape = heuristic_shape("select * from orders where x = 1");
        assert_eq!(shape.source_tables[0].alias, None);
    }
}
