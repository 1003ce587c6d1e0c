//! Structured analysis of business DML. The interceptor needs three things
//! from a statement before it runs: what kind of write it is, which table it
//! touches, and which predicate (with which bind parameters) selects the
//! affected rows.

use crate::executor::{count_placeholders, literal_value, SqlValue};
use common::{ErrorKind, TxError, TxResult};
use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, SetExpr, Statement, Value as AstValue};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmlType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for DmlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DmlType::Insert => "INSERT",
            DmlType::Update => "UPDATE",
            DmlType::Delete => "DELETE",
        };
        write!(f, "{}", name)
    }
}

/// One VALUES cell of an INSERT: either a literal or a reference into the
/// statement's bind parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertCell {
    Literal(SqlValue),
    Param(usize),
}

impl InsertCell {
    pub fn resolve(&self, params: &[SqlValue]) -> TxResult<SqlValue> {
        match self {
            InsertCell::Literal(value) => Ok(value.clone()),
            InsertCell::Param(index) => params.get(*index).cloned().ok_or_else(|| {
                TxError::new(ErrorKind::UnsupportedSql, "not enough bind parameters")
            }),
        }
    }
}

/// Everything the interceptor learns from one DML statement.
#[derive(Debug, Clone, PartialEq)]
pub struct DmlInfo {
    pub sql_type: DmlType,
    pub table: String,
    /// WHERE text with placeholders preserved, reusable in an image SELECT.
    pub where_sql: Option<String>,
    /// Slice of the statement's params that bind the WHERE clause.
    pub where_params_offset: usize,
    pub where_params_len: usize,
    /// INSERT only: column list (empty means "all table columns in order").
    pub insert_columns: Vec<String>,
    /// INSERT only: one entry per VALUES row.
    pub insert_values: Vec<Vec<InsertCell>>,
}

impl DmlInfo {
    pub fn where_params<'a>(&self, params: &'a [SqlValue]) -> &'a [SqlValue] {
        let start = self.where_params_offset.min(params.len());
        let end = (self.where_params_offset + self.where_params_len).min(params.len());
        &params[start..end]
    }

    /// The SELECT that captures this statement's before-image.
    pub fn image_query(&self) -> String {
        match &self.where_sql {
            Some(where_sql) => format!("SELECT * FROM {} WHERE {}", self.table, where_sql),
            None => format!("SELECT * FROM {}", self.table),
        }
    }
}

/// Classifies one statement. `Ok(None)` means the statement is not an
/// intercepted DML (SELECT, DDL, ...) and must pass straight through.
pub fn analyze(sql: &str) -> TxResult<Option<DmlInfo>> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| TxError::new(ErrorKind::UnsupportedSql, e.to_string()))?;
    if statements.len() != 1 {
        return Err(TxError::new(
            ErrorKind::UnsupportedSql,
            format!("expected one statement, got {}", statements.len()),
        ));
    }

    match statements.remove(0) {
        Statement::Insert {
            table_name,
            columns,
            source,
            ..
        } => {
            let rows = match source.body.as_ref() {
                SetExpr::Values(values) => &values.rows,
                other => {
                    return Err(TxError::new(
                        ErrorKind::UnsupportedSql,
                        format!("unsupported INSERT source {}", other),
                    ))
                }
            };
            let mut param_index = 0_usize;
            let mut insert_values = Vec::with_capacity(rows.len());
            for row in rows {
                let mut cells = Vec::with_capacity(row.len());
                for expr in row {
                    cells.push(insert_cell(expr, &mut param_index)?);
                }
                insert_values.push(cells);
            }
            Ok(Some(DmlInfo {
                sql_type: DmlType::Insert,
                table: table_name.to_string(),
                where_sql: None,
                where_params_offset: 0,
                where_params_len: 0,
                insert_columns: columns.iter().map(|c| c.value.clone()).collect(),
                insert_values,
            }))
        }
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => {
            let table = match &table.relation {
                sqlparser::ast::TableFactor::Table { name, .. } => name.to_string(),
                other => {
                    return Err(TxError::new(
                        ErrorKind::UnsupportedSql,
                        format!("unsupported UPDATE target {}", other),
                    ))
                }
            };
            let set_params: usize = assignments
                .iter()
                .map(|a| count_placeholders(&a.value))
                .sum();
            Ok(Some(DmlInfo {
                sql_type: DmlType::Update,
                table,
                where_params_offset: set_params,
                where_params_len: selection.as_ref().map_or(0, count_placeholders),
                where_sql: selection.map(|expr| expr.to_string()),
                insert_columns: Vec::new(),
                insert_values: Vec::new(),
            }))
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
            let table = match &from[0].relation {
                sqlparser::ast::TableFactor::Table { name, .. } => name.to_string(),
                other => {
                    return Err(TxError::new(
                        ErrorKind::UnsupportedSql,
                        format!("unsupported DELETE target {}", other),
                    ))
                }
            };
            Ok(Some(DmlInfo {
                sql_type: DmlType::Delete,
                table,
                where_params_offset: 0,
                where_params_len: selection.as_ref().map_or(0, count_placeholders),
                where_sql: selection.map(|expr| expr.to_string()),
                insert_columns: Vec::new(),
                insert_values: Vec::new(),
            }))
        }
        _ => Ok(None),
    }
}

fn insert_cell(expr: &Expr, param_index: &mut usize) -> TxResult<InsertCell> {
    match expr {
        Expr::Value(AstValue::Placeholder(_)) => {
            let cell = InsertCell::Param(*param_index);
            *param_index += 1;
            Ok(cell)
        }
        Expr::Value(value) => Ok(InsertCell::Literal(literal_value(value)?)),
        other => Err(TxError::new(
            ErrorKind::UnsupportedSql,
            format!("unsupported INSERT value {}", other),
        )),
    }
}
