//! The narrow seam between the framework and a database driver, plus an
//! in-memory implementation of it used by tests and single-process demos.

use async_trait::async_trait;
use common::{ErrorKind, TxError, TxResult};
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    Assignment, BinaryOperator, Expr, Query, SetExpr, Statement, Value as AstValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One cell of a row. The subset of SQL types the framework moves around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
}

impl SqlValue {
    pub fn as_key_string(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Integer(v) => v.to_string(),
            SqlValue::Float(v) => v.to_string(),
            SqlValue::Text(v) => v.clone(),
            SqlValue::Boolean(v) => v.to_string(),
        }
    }
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        use SqlValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Integer(a), Integer(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Integer(a), Float(b)) | (Float(b), Integer(a)) => *a as f64 == *b,
            (Text(a), Text(b)) => a == b,
            (Boolean(a), Boolean(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(v) => write!(f, "{}", v),
            SqlValue::Float(v) => write!(f, "{}", v),
            SqlValue::Text(v) => write!(f, "'{}'", v),
            SqlValue::Boolean(v) => write!(f, "{}", v),
        }
    }
}

pub type Row = Vec<SqlValue>;

/// Column layout of a table as the driver reports it. Image capture and
/// reverse-SQL generation key off the primary-key columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub columns: Vec<String>,
    pub pk_columns: Vec<String>,
}

impl TableMeta {
    pub fn pk_positions(&self) -> Vec<usize> {
        self.pk_columns
            .iter()
            .filter_map(|pk| self.columns.iter().position(|c| c == pk))
            .collect()
    }
}

/// What the framework needs from a database driver: metadata and local
/// transactions. `?` placeholders bind positionally from the params slice.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn table_meta(&self, table: &str) -> TxResult<TableMeta>;

    async fn begin_local(&self) -> TxResult<Box<dyn LocalTransaction>>;

    /// One-shot statement in its own local transaction.
    async fn execute_autocommit(&self, sql: &str, params: &[SqlValue]) -> TxResult<u64> {
        let mut tx = self.begin_local().await?;
        let affected = tx.execute(sql, params).await?;
        tx.commit().await?;
        Ok(affected)
    }

    /// One-shot query in its own local transaction.
    async fn query_autocommit(&self, sql: &str, params: &[SqlValue]) -> TxResult<Vec<Row>> {
        let mut tx = self.begin_local().await?;
        let rows = tx.query(sql, params).await?;
        tx.commit().await?;
        Ok(rows)
    }
}

/// A local transaction on the business database. Everything the interceptor
/// does for one DML statement happens inside a single one of these.
#[async_trait]
pub trait LocalTransaction: Send {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> TxResult<Vec<Row>>;

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> TxResult<u64>;

    async fn commit(self: Box<Self>) -> TxResult<()>;

    async fn rollback(self: Box<Self>) -> TxResult<()>;
}

#[derive(Debug, Clone)]
struct MemTable {
    meta: TableMeta,
    rows: Vec<Row>,
}

#[derive(Debug, Clone, Default)]
struct MemState {
    tables: HashMap<String, MemTable>,
}

/// In-memory executor speaking the DML/SELECT subset the interceptor and
/// undo manager emit: single-table statements, `?` placeholders, equality
/// and comparison predicates joined by AND, and arithmetic in UPDATE SET
/// expressions. Local transactions serialize on the state mutex and roll
/// back by snapshot restore.
#[derive(Debug, Default, Clone)]
pub struct MemoryExecutor {
    state: Arc<Mutex<MemState>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table. The driver-level analogue of dialing in to an
    /// existing schema.
    pub async fn create_table(&self, name: &str, columns: &[&str], pk_columns: &[&str]) {
        let mut state = self.state.lock().await;
        state.tables.insert(
            name.to_string(),
            MemTable {
                meta: TableMeta {
                    name: name.to_string(),
                    columns: columns.iter().map(|c| c.to_string()).collect(),
                    pk_columns: pk_columns.iter().map(|c| c.to_string()).collect(),
                },
                rows: Vec::new(),
            },
        );
    }

    /// Direct row dump for assertions, in table column order.
    pub async fn rows_of(&self, table: &str) -> Vec<Row> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SqlExecutor for MemoryExecutor {
    async fn table_meta(&self, table: &str) -> TxResult<TableMeta> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|t| t.meta.clone())
            .ok_or_else(|| TxError::new(ErrorKind::ResourceNotFound, format!("table {}", table)))
    }

    async fn begin_local(&self) -> TxResult<Box<dyn LocalTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            snapshot,
            done: false,
        }))
    }
}

/// Holds the state mutex for its whole lifetime: local transactions are
/// serialized, and rollback restores the entry snapshot.
struct MemoryTransaction {
    guard: OwnedMutexGuard<MemState>,
    snapshot: MemState,
    done: bool,
}

#[async_trait]
impl LocalTransaction for MemoryTransaction {
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> TxResult<Vec<Row>> {
        run_query(&self.guard, sql, params)
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> TxResult<u64> {
        run_execute(&mut self.guard, sql, params)
    }

    async fn commit(self: Box<Self>) -> TxResult<()> {
        let mut this = self;
        this.done = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> TxResult<()> {
        let mut this = self;
        *this.guard = this.snapshot.clone();
        this.done = true;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        // dropping an open transaction discards its writes
        if !self.done {
            *self.guard = self.snapshot.clone();
        }
    }
}

fn parse_one(sql: &str) -> TxResult<Statement> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| TxError::new(ErrorKind::UnsupportedSql, e.to_string()))?;
    if statements.len() != 1 {
        return Err(TxError::new(
            ErrorKind::UnsupportedSql,
            format!("expected one statement, got {}", statements.len()),
        ));
    }
    Ok(statements.remove(0))
}

/// Positional cursor over the `?` placeholders of one statement.
struct ParamCursor<'a> {
    params: &'a [SqlValue],
    next: usize,
}

impl<'a> ParamCursor<'a> {
    fn new(params: &'a [SqlValue]) -> Self {
        Self { params, next: 0 }
    }

    fn take(&mut self) -> TxResult<SqlValue> {
        let value = self.params.get(self.next).cloned().ok_or_else(|| {
            TxError::new(ErrorKind::UnsupportedSql, "not enough bind parameters")
        })?;
        self.next += 1;
        Ok(value)
    }
}

pub(crate) fn literal_value(value: &AstValue) -> TxResult<SqlValue> {
    match value {
        AstValue::Number(text, _) => {
            if text.contains('.') {
                text.parse::<f64>()
                    .map(SqlValue::Float)
                    .map_err(|e| TxError::new(ErrorKind::UnsupportedSql, e.to_string()))
            } else {
                text.parse::<i64>()
                    .map(SqlValue::Integer)
                    .map_err(|e| TxError::new(ErrorKind::UnsupportedSql, e.to_string()))
            }
        }
        AstValue::SingleQuotedString(text) | AstValue::DoubleQuotedString(text) => {
            Ok(SqlValue::Text(text.clone()))
        }
        AstValue::Boolean(b) => Ok(SqlValue::Boolean(*b)),
        AstValue::Null => Ok(SqlValue::Null),
        other => Err(TxError::new(
            ErrorKind::UnsupportedSql,
            format!("unsupported literal {}", other),
        )),
    }
}

fn eval_expr(
    expr: &Expr,
    meta: &TableMeta,
    row: Option<&Row>,
    cursor: &mut ParamCursor<'_>,
) -> TxResult<SqlValue> {
    match expr {
        Expr::Value(AstValue::Placeholder(_)) => cursor.take(),
        Expr::Value(value) => literal_value(value),
        Expr::Identifier(ident) => {
            let row = row.ok_or_else(|| {
                TxError::new(ErrorKind::UnsupportedSql, "column reference without a row")
            })?;
            let position = meta
                .columns
                .iter()
                .position(|c| c == &ident.value)
                .ok_or_else(|| {
                    TxError::new(
                        ErrorKind::UnsupportedSql,
                        format!("unknown column {}", ident.value),
                    )
                })?;
            Ok(row[position].clone())
        }
        Expr::Nested(inner) => eval_expr(inner, meta, row, cursor),
        Expr::UnaryOp { op, expr } => {
            use sqlparser::ast::UnaryOperator;
            let value = eval_expr(expr, meta, row, cursor)?;
            match (op, value) {
                (UnaryOperator::Minus, SqlValue::Integer(v)) => Ok(SqlValue::Integer(-v)),
                (UnaryOperator::Minus, SqlValue::Float(v)) => Ok(SqlValue::Float(-v)),
                (op, value) => Err(TxError::new(
                    ErrorKind::UnsupportedSql,
                    format!("unsupported unary {} on {}", op, value),
                )),
            }
        }
        Expr::BinaryOp { left, op, right } => {
            let lhs = eval_expr(left, meta, row, cursor)?;
            let rhs = eval_expr(right, meta, row, cursor)?;
            numeric_op(op, lhs, rhs)
        }
        other => Err(TxError::new(
            ErrorKind::UnsupportedSql,
            format!("unsupported expression {}", other),
        )),
    }
}

fn numeric_op(op: &BinaryOperator, lhs: SqlValue, rhs: SqlValue) -> TxResult<SqlValue> {
    let as_float = |v: &SqlValue| match v {
        SqlValue::Integer(i) => Some(*i as f64),
        SqlValue::Float(f) => Some(*f),
        _ => None,
    };
    let both_int = matches!((&lhs, &rhs), (SqlValue::Integer(_), SqlValue::Integer(_)));
    let (a, b) = match (as_float(&lhs), as_float(&rhs)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(TxError::new(
                ErrorKind::UnsupportedSql,
                format!("non-numeric operands for {}", op),
            ))
        }
    };
    let result = match op {
        BinaryOperator::Plus => a + b,
        BinaryOperator::Minus => a - b,
        BinaryOperator::Multiply => a * b,
        BinaryOperator::Divide => a / b,
        other => {
            return Err(TxError::new(
                ErrorKind::UnsupportedSql,
                format!("unsupported operator {}", other),
            ))
        }
    };
    if both_int && result.fract() == 0.0 {
        Ok(SqlValue::Integer(result as i64))
    } else {
        Ok(SqlValue::Float(result))
    }
}

/// A WHERE clause as the subset understands it: AND-joined comparisons of a
/// column against an evaluated value.
fn matches_where(
    expr: &Expr,
    meta: &TableMeta,
    row: &Row,
    cursor: &mut ParamCursor<'_>,
) -> TxResult<bool> {
    match expr {
        Expr::BinaryOp { left, op, right } if *op == BinaryOperator::And => {
            // evaluate both sides even when the left is false so the
            // placeholder cursor stays aligned
            let lhs = matches_where(left, meta, row, cursor)?;
            let rhs = matches_where(right, meta, row, cursor)?;
            Ok(lhs && rhs)
        }
        Expr::Nested(inner) => matches_where(inner, meta, row, cursor),
        Expr::BinaryOp { left, op, right } => {
            let column = match left.as_ref() {
                Expr::Identifier(ident) => ident.value.clone(),
                other => {
                    return Err(TxError::new(
                        ErrorKind::UnsupportedSql,
                        format!("unsupported predicate lhs {}", other),
                    ))
                }
            };
            let position = meta
                .columns
                .iter()
                .position(|c| c == &column)
                .ok_or_else(|| {
                    TxError::new(ErrorKind::UnsupportedSql, format!("unknown column {}", column))
                })?;
            let expected = eval_expr(right, meta, Some(row), cursor)?;
            let actual = &row[position];
            compare(op, actual, &expected)
        }
        other => Err(TxError::new(
            ErrorKind::UnsupportedSql,
            format!("unsupported predicate {}", other),
        )),
    }
}

fn compare(op: &BinaryOperator, actual: &SqlValue, expected: &SqlValue) -> TxResult<bool> {
    let ordering = |a: &SqlValue, b: &SqlValue| -> Option<std::cmp::Ordering> {
        use SqlValue::*;
        match (a, b) {
            (Integer(x), Integer(y)) => Some(x.cmp(y)),
            (Float(x), Float(y)) => x.partial_cmp(y),
            (Integer(x), Float(y)) => (*x as f64).partial_cmp(y),
            (Float(x), Integer(y)) => x.partial_cmp(&(*y as f64)),
            (Text(x), Text(y)) => Some(x.cmp(y)),
            _ => None,
        }
    };
    match op {
        BinaryOperator::Eq => Ok(actual == expected),
        BinaryOperator::NotEq => Ok(actual != expected),
        BinaryOperator::Lt => Ok(ordering(actual, expected) == Some(std::cmp::Ordering::Less)),
        BinaryOperator::Gt => Ok(ordering(actual, expected) == Some(std::cmp::Ordering::Greater)),
        BinaryOperator::LtEq => Ok(matches!(
            ordering(actual, expected),
            Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
        )),
        BinaryOperator::GtEq => Ok(matches!(
            ordering(actual, expected),
            Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
        )),
        other => Err(TxError::new(
            ErrorKind::UnsupportedSql,
            format!("unsupported comparison {}", other),
        )),
    }
}

fn values_rows(query: &Query) -> TxResult<Vec<Vec<Expr>>> {
    match query.body.as_ref() {
        SetExpr::Values(values) => Ok(values.rows.clone()),
        other => Err(TxError::new(
            ErrorKind::UnsupportedSql,
            format!("unsupported INSERT source {}", other),
        )),
    }
}

fn run_query(state: &MemState, sql: &str, params: &[SqlValue]) -> TxResult<Vec<Row>> {
    let statement = parse_one(sql)?;
    let query = match statement {
        Statement::Query(query) => query,
        other => {
            return Err(TxError::new(
                ErrorKind::UnsupportedSql,
                format!("expected SELECT, got {}", other),
            ))
        }
    };
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select.clone(),
        other => {
            return Err(TxError::new(
                ErrorKind::UnsupportedSql,
                format!("unsupported query {}", other),
            ))
        }
    };
    if select.from.len() != 1 {
        return Err(TxError::new(ErrorKind::UnsupportedSql, "single-table queries only"));
    }
    let table_name = table_factor_name(&select.from[0].relation)?;
    let table = state
        .tables
        .get(&table_name)
        .ok_or_else(|| TxError::new(ErrorKind::ResourceNotFound, format!("table {}", table_name)))?;

    // projection: `*` keeps table order, otherwise named columns
    use sqlparser::ast::{SelectItem, Expr as SExpr};
    let projection: Option<Vec<usize>> = if select.projection.len() == 1
        && matches!(select.projection[0], SelectItem::Wildcard(_))
    {
        None
    } else {
        let mut positions = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(SExpr::Identifier(ident)) => {
                    let position = table
                        .meta
                        .columns
                        .iter()
                        .position(|c| c == &ident.value)
                        .ok_or_else(|| {
                            TxError::new(
                                ErrorKind::UnsupportedSql,
                                format!("unknown column {}", ident.value),
                            )
                        })?;
                    positions.push(position);
                }
                other => {
                    return Err(TxError::new(
                        ErrorKind::UnsupportedSql,
                        format!("unsupported projection {:?}", other),
                    ))
                }
            }
        }
        Some(positions)
    };

    let mut result = Vec::new();
    for row in &table.rows {
        let keep = match &select.selection {
            Some(where_expr) => {
                let mut cursor = ParamCursor::new(params);
                matches_where(where_expr, &table.meta, row, &mut cursor)?
            }
            None => true,
        };
        if keep {
            match &projection {
                None => result.push(row.clone()),
                Some(positions) => {
                    result.push(positions.iter().map(|p| row[*p].clone()).collect())
                }
            }
        }
    }
    Ok(result)
}

fn table_factor_name(relation: &sqlparser::ast::TableFactor) -> TxResult<String> {
    match relation {
        sqlparser::ast::TableFactor::Table { name, .. } => Ok(name.to_string()),
        other => Err(TxError::new(
            ErrorKind::UnsupportedSql,
            format!("unsupported relation {}", other),
        )),
    }
}

fn run_execute(state: &mut MemState, sql: &str, params: &[SqlValue]) -> TxResult<u64> {
    let statement = parse_one(sql)?;
    match statement {
        Statement::Insert {
            table_name,
            columns,
            source,
            ..
        } => {
            let table_name = table_name.to_string();
            let table = state.tables.get_mut(&table_name).ok_or_else(|| {
                TxError::new(ErrorKind::ResourceNotFound, format!("table {}", table_name))
            })?;
            let meta = table.meta.clone();
            let column_names: Vec<String> = if columns.is_empty() {
                meta.columns.clone()
            } else {
                columns.iter().map(|c| c.value.clone()).collect()
            };
            let mut cursor = ParamCursor::new(params);
            let mut inserted = 0_u64;
            for value_row in values_rows(&source)? {
                if value_row.len() != column_names.len() {
                    return Err(TxError::new(
                        ErrorKind::UnsupportedSql,
                        "VALUES arity does not match column list",
                    ));
                }
                let mut row: Row = vec![SqlValue::Null; meta.columns.len()];
                for (column, expr) in column_names.iter().zip(value_row.iter()) {
                    let position =
                        meta.columns.iter().position(|c| c == column).ok_or_else(|| {
                            TxError::new(
                                ErrorKind::UnsupportedSql,
                                format!("unknown column {}", column),
                            )
                        })?;
                    row[position] = eval_expr(expr, &meta, None, &mut cursor)?;
                }
                table.rows.push(row);
                inserted += 1;
            }
            Ok(inserted)
        }
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => {
            let table_name = table_factor_name(&table.relation)?;
            let mem_table = state.tables.get_mut(&table_name).ok_or_else(|| {
                TxError::new(ErrorKind::ResourceNotFound, format!("table {}", table_name))
            })?;
            let meta = mem_table.meta.clone();
            let set_param_count = assignments
                .iter()
                .map(|a| count_placeholders(&a.value))
                .sum::<usize>()
                .min(params.len());
            let (set_params, where_params) = params.split_at(set_param_count);

            let mut affected = 0_u64;
            for row in mem_table.rows.iter_mut() {
                let keep = match &selection {
                    Some(where_expr) => {
                        let mut where_cursor = ParamCursor::new(where_params);
                        matches_where(where_expr, &meta, row, &mut where_cursor)?
                    }
                    None => true,
                };
                if !keep {
                    continue;
                }
                let mut set_cursor = ParamCursor::new(set_params);
                let mut updated = row.clone();
                for Assignment { id, value } in &assignments {
                    let column = id
                        .last()
                        .map(|ident| ident.value.clone())
                        .unwrap_or_default();
                    let position =
                        meta.columns.iter().position(|c| c == &column).ok_or_else(|| {
                            TxError::new(
                                ErrorKind::UnsupportedSql,
                                format!("unknown column {}", column),
                            )
                        })?;
                    updated[position] = eval_expr(value, &meta, Some(&*row), &mut set_cursor)?;
                }
                *row = updated;
                affected += 1;
            }
            Ok(affected)
        }
        Statement::Delete {
            from, selection, ..
        } => {
            if from.len() != 1 {
                return Err(TxError::new(
                    ErrorKind::UnsupportedSql,
                    "single-table DELETE only",
                ));
            }
            let table_name = table_factor_name(&from[0].relation)?;
            let mem_table = state.tables.get_mut(&table_name).ok_or_else(|| {
                TxError::new(ErrorKind::ResourceNotFound, format!("table {}", table_name))
            })?;
            let meta = mem_table.meta.clone();
            let mut affected = 0_u64;
            let mut kept = Vec::with_capacity(mem_table.rows.len());
            for row in mem_table.rows.drain(..) {
                let matched = match &selection {
                    Some(where_expr) => {
                        let mut cursor = ParamCursor::new(params);
                        matches_where(where_expr, &meta, &row, &mut cursor)?
                    }
                    None => true,
                };
                if matched {
                    affected += 1;
                } else {
                    kept.push(row);
                }
            }
            mem_table.rows = kept;
            Ok(affected)
        }
        other => Err(TxError::new(
            ErrorKind::UnsupportedSql,
            format!("unsupported statement {}", other),
        )),
    }
}

/// Number of `?` markers below an expression, in textual order.
pub(crate) fn count_placeholders(expr: &Expr) -> usize {
    match expr {
        Expr::Value(AstValue::Placeholder(_)) => 1,
        Expr::BinaryOp { left, right, .. } => {
            count_placeholders(left) + count_placeholders(right)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => count_placeholders(expr),
        _ => 0,
    }
}
