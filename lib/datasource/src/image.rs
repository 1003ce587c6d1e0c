//! Row-set snapshots taken around a business DML statement. Serialized into
//! the undo log as JSON and compared cell-for-cell during compensation.

use crate::executor::{Row, SqlValue, TableMeta};
use serde::{Deserialize, Serialize};

/// A before- or after-image: the affected rows of one table in column
/// order, plus enough metadata to rebuild primary-key predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordImage {
    pub table: String,
    pub columns: Vec<String>,
    pub pk_columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl RecordImage {
    pub fn empty(meta: &TableMeta) -> Self {
        Self {
            table: meta.name.clone(),
            columns: meta.columns.clone(),
            pk_columns: meta.pk_columns.clone(),
            rows: Vec::new(),
        }
    }

    pub fn new(meta: &TableMeta, rows: Vec<Row>) -> Self {
        Self {
            table: meta.name.clone(),
            columns: meta.columns.clone(),
            pk_columns: meta.pk_columns.clone(),
            rows,
        }
    }

    /// A sibling image over the same table layout with different rows.
    pub fn with_layout(other: &RecordImage, rows: Vec<Row>) -> Self {
        Self {
            table: other.table.clone(),
            columns: other.columns.clone(),
            pk_columns: other.pk_columns.clone(),
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn pk_positions(&self) -> Vec<usize> {
        self.pk_columns
            .iter()
            .filter_map(|pk| self.columns.iter().position(|c| c == pk))
            .collect()
    }

    /// Primary-key tuple of one row, composite keys joined with `_`.
    pub fn pk_of(&self, row: &Row) -> String {
        self.pk_positions()
            .iter()
            .map(|p| row[*p].as_key_string())
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Primary-key values of one row, in `pk_columns` order.
    pub fn pk_values(&self, row: &Row) -> Vec<SqlValue> {
        self.pk_positions().iter().map(|p| row[*p].clone()).collect()
    }

    /// All pk tuples in this image, for lock keys and pk lookups.
    pub fn pk_list(&self) -> Vec<String> {
        self.rows.iter().map(|row| self.pk_of(row)).collect()
    }

    /// The `table:pk1,pk2` lock-key fragment for this image.
    pub fn lock_key(&self) -> Option<String> {
        if self.rows.is_empty() {
            return None;
        }
        Some(format!("{}:{}", self.table, self.pk_list().join(",")))
    }

    /// Row lookup by pk tuple, for image-vs-current comparison.
    pub fn row_by_pk(&self, pk: &str) -> Option<&Row> {
        self.rows.iter().find(|row| self.pk_of(row) == pk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> TableMeta {
        TableMeta {
            name: "account".to_string(),
            columns: vec!["id".to_string(), "tenant".to_string(), "balance".to_string()],
            pk_columns: vec!["id".to_string(), "tenant".to_string()],
        }
    }

    #[test]
    fn composite_pks_join_with_underscore() {
        let image = RecordImage::new(
            &meta(),
            vec![vec![
                SqlValue::Integer(1),
                SqlValue::Text("acme".to_string()),
                SqlValue::Integer(100),
            ]],
        );
        assert_eq!(image.pk_list(), vec!["1_acme"]);
        assert_eq!(image.lock_key().unwrap(), "account:1_acme");
    }

    #[test]
    fn empty_image_has_no_lock_key() {
        let image = RecordImage::empty(&meta());
        assert!(image.lock_key().is_none());
    }

    #[test]
    fn images_serialize_symmetrically() {
        let image = RecordImage::new(
            &meta(),
            vec![vec![
                SqlValue::Integer(1),
                SqlValue::Text("acme".to_string()),
                SqlValue::Float(99.5),
            ]],
        );
        let json = serde_json::to_string(&image).unwrap();
        let back: RecordImage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, image);
    }
}
