//! Undo-log persistence and reverse-SQL compensation. The log row is written
//! in the same local transaction as the business DML — that atomicity is the
//! load-bearing invariant of AT mode — and compensation runs in one local
//! transaction of its own: verify against the after-image, execute the
//! reverse statement, mark the log row, delete it.

use crate::executor::{LocalTransaction, MemoryExecutor, Row, SqlExecutor, SqlValue};
use crate::image::RecordImage;
use crate::sql::DmlType;
use common::{BranchId, ErrorKind, TxError, TxResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, warn};

pub const UNDO_LOG_TABLE: &str = "undo_log";

pub const UNDO_LOG_COLUMNS: [&str; 12] = [
    "id",
    "xid",
    "branch_id",
    "table_name",
    "sql_type",
    "before_image",
    "after_image",
    "sql_text",
    "parameters",
    "log_status",
    "create_time",
    "update_time",
];

/// Schema of the undo log in the business database.
pub const UNDO_LOG_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS undo_log (
    id           BIGINT       NOT NULL PRIMARY KEY,
    xid          VARCHAR(128) NOT NULL,
    branch_id    BIGINT       NOT NULL,
    table_name   VARCHAR(128) NOT NULL,
    sql_type     VARCHAR(16)  NOT NULL,
    before_image TEXT,
    after_image  TEXT,
    sql_text     TEXT,
    parameters   TEXT,
    log_status   TINYINT      NOT NULL,
    create_time  BIGINT       NOT NULL,
    update_time  BIGINT       NOT NULL,
    INDEX idx_xid_branch (xid, branch_id),
    INDEX idx_create_time (create_time)
);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UndoStatus {
    Normal = 0,
    Compensating = 1,
    Compensated = 2,
}

impl UndoStatus {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => UndoStatus::Compensating,
            2 => UndoStatus::Compensated,
            _ => UndoStatus::Normal,
        }
    }
}

/// One undo-log row, images included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoLogRecord {
    pub id: i64,
    pub xid: String,
    pub branch_id: BranchId,
    pub table_name: String,
    pub sql_type: DmlType,
    pub before_image: RecordImage,
    pub after_image: RecordImage,
    pub sql_text: String,
    pub parameters: String,
    pub log_status: UndoStatus,
    pub create_time_ms: i64,
    pub update_time_ms: i64,
}

/// Writes, reads and replays undo-log rows against a business database.
#[derive(Debug, Default)]
pub struct UndoLogManager {
    id_sequence: AtomicI64,
}

impl UndoLogManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the undo-log table on the bundled in-memory executor.
    /// Relational deployments run [`UNDO_LOG_DDL`] instead.
    pub async fn install(executor: &MemoryExecutor) {
        executor
            .create_table(UNDO_LOG_TABLE, &UNDO_LOG_COLUMNS, &["id"])
            .await;
    }

    fn next_id(&self) -> i64 {
        let seq = self.id_sequence.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
        (chrono::Utc::now().timestamp_millis() << 16) | seq
    }

    /// Inserts the undo row inside the caller's open local transaction so it
    /// commits (or rolls back) together with the business DML.
    pub async fn insert_undo_log(
        &self,
        tx: &mut Box<dyn LocalTransaction>,
        xid: &str,
        branch_id: BranchId,
        sql_type: DmlType,
        before_image: &RecordImage,
        after_image: &RecordImage,
        sql_text: &str,
        parameters: &[SqlValue],
    ) -> TxResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let params_json = serde_json::to_string(parameters)?;
        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            UNDO_LOG_TABLE,
            UNDO_LOG_COLUMNS.join(", ")
        );
        tx.execute(
            &sql,
            &[
                SqlValue::Integer(self.next_id()),
                SqlValue::Text(xid.to_string()),
                SqlValue::Integer(branch_id.as_i64()),
                SqlValue::Text(before_image.table.clone()),
                SqlValue::Text(sql_type.to_string()),
                SqlValue::Text(serde_json::to_string(before_image)?),
                SqlValue::Text(serde_json::to_string(after_image)?),
                SqlValue::Text(sql_text.to_string()),
                SqlValue::Text(params_json),
                SqlValue::Integer(UndoStatus::Normal as i64),
                SqlValue::Integer(now),
                SqlValue::Integer(now),
            ],
        )
        .await?;
        Ok(())
    }

    async fn find_undo_logs(
        &self,
        tx: &mut Box<dyn LocalTransaction>,
        xid: &str,
        branch_id: BranchId,
    ) -> TxResult<Vec<UndoLogRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE xid = ? AND branch_id = ?",
            UNDO_LOG_TABLE
        );
        let rows = tx
            .query(
                &sql,
                &[
                    SqlValue::Text(xid.to_string()),
                    SqlValue::Integer(branch_id.as_i64()),
                ],
            )
            .await?;
        rows.iter().map(parse_undo_row).collect()
    }

    /// Phase-2 commit cleanup: the business write stands, the images are no
    /// longer needed.
    pub async fn delete_undo_logs(
        &self,
        executor: &dyn SqlExecutor,
        xid: &str,
        branch_id: BranchId,
    ) -> TxResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE xid = ? AND branch_id = ?",
            UNDO_LOG_TABLE
        );
        executor
            .execute_autocommit(
                &sql,
                &[
                    SqlValue::Text(xid.to_string()),
                    SqlValue::Integer(branch_id.as_i64()),
                ],
            )
            .await
    }

    /// Phase-2 rollback: replay every undo row of the branch in reverse
    /// order inside one local transaction.
    ///
    /// A missing log is a success when phase-1 never completed (the local
    /// transaction carrying the log never committed) and a compensation
    /// failure otherwise.
    pub async fn compensate(
        &self,
        executor: &dyn SqlExecutor,
        xid: &str,
        branch_id: BranchId,
        phase_one_completed: bool,
    ) -> TxResult<()> {
        let mut tx = executor.begin_local().await?;
        let records = self.find_undo_logs(&mut tx, xid, branch_id).await?;

        if records.is_empty() {
            tx.commit().await?;
            if phase_one_completed {
                return Err(TxError::new(
                    ErrorKind::NoUndoLog,
                    format!("no undo log for xid {} branch {}", xid, branch_id),
                ));
            }
            debug!(xid, %branch_id, "no undo log and phase-1 never completed, nothing to undo");
            return Ok(());
        }

        for record in records.iter().rev() {
            if record.log_status == UndoStatus::Compensated {
                continue;
            }
            if let Err(err) = self.replay(&mut tx, record).await {
                tx.rollback().await?;
                return Err(err);
            }
        }
        tx.commit().await?;
        debug!(xid, %branch_id, "compensation applied");
        Ok(())
    }

    async fn replay(
        &self,
        tx: &mut Box<dyn LocalTransaction>,
        record: &UndoLogRecord,
    ) -> TxResult<()> {
        self.verify_after_image(tx, record).await?;

        match record.sql_type {
            DmlType::Insert => {
                // inserted rows are removed by primary key
                for row in &record.after_image.rows {
                    let (sql, params) =
                        pk_delete(&record.after_image, row);
                    tx.execute(&sql, &params).await?;
                }
            }
            DmlType::Update => {
                // each row is restored to its before-image values
                for row in &record.before_image.rows {
                    let (sql, params) = restore_update(&record.before_image, row);
                    tx.execute(&sql, &params).await?;
                }
            }
            DmlType::Delete => {
                // deleted rows are re-inserted from the before-image
                for row in &record.before_image.rows {
                    let (sql, params) = reinsert(&record.before_image, row);
                    tx.execute(&sql, &params).await?;
                }
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        tx.execute(
            &format!(
                "UPDATE {} SET log_status = ?, update_time = ? WHERE id = ?",
                UNDO_LOG_TABLE
            ),
            &[
                SqlValue::Integer(UndoStatus::Compensated as i64),
                SqlValue::Integer(now),
                SqlValue::Integer(record.id),
            ],
        )
        .await?;
        tx.execute(
            &format!("DELETE FROM {} WHERE id = ?", UNDO_LOG_TABLE),
            &[SqlValue::Integer(record.id)],
        )
        .await?;
        Ok(())
    }

    /// Compares the rows the statement touched against the after-image. Any
    /// divergence means a non-AT writer got in between and compensation must
    /// abort rather than clobber it.
    async fn verify_after_image(
        &self,
        tx: &mut Box<dyn LocalTransaction>,
        record: &UndoLogRecord,
    ) -> TxResult<()> {
        match record.sql_type {
            DmlType::Insert | DmlType::Update => {
                for row in &record.after_image.rows {
                    let pk = record.after_image.pk_of(row);
                    let current =
                        fetch_by_pk(tx, &record.after_image, row).await?;
                    match current {
                        Some(current_row) if current_row == *row => {}
                        Some(_) => {
                            warn!(table = %record.table_name, %pk, "after-image mismatch");
                            return Err(dirty(record, &pk));
                        }
                        None => {
                            warn!(table = %record.table_name, %pk, "row vanished since phase-1");
                            return Err(dirty(record, &pk));
                        }
                    }
                }
            }
            DmlType::Delete => {
                // the statement removed these rows; anything back under the
                // same key was written by somebody else
                for row in &record.before_image.rows {
                    let pk = record.before_image.pk_of(row);
                    if fetch_by_pk(tx, &record.before_image, row).await?.is_some() {
                        warn!(table = %record.table_name, %pk, "deleted row reappeared");
                        return Err(dirty(record, &pk));
                    }
                }
            }
        }
        Ok(())
    }
}

fn dirty(record: &UndoLogRecord, pk: &str) -> TxError {
    TxError::new(
        ErrorKind::DirtyWrite,
        format!("table {} pk {} diverged from after-image", record.table_name, pk),
    )
}

fn pk_predicate(image: &RecordImage) -> String {
    image
        .pk_columns
        .iter()
        .map(|c| format!("{} = ?", c))
        .collect::<Vec<_>>()
        .join(" AND ")
}

async fn fetch_by_pk(
    tx: &mut Box<dyn LocalTransaction>,
    image: &RecordImage,
    row: &Row,
) -> TxResult<Option<Row>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {}",
        image.table,
        pk_predicate(image)
    );
    let mut rows = tx.query(&sql, &image.pk_values(row)).await?;
    Ok(if rows.is_empty() {
        None
    } else {
        Some(rows.remove(0))
    })
}

fn pk_delete(image: &RecordImage, row: &Row) -> (String, Vec<SqlValue>) {
    (
        format!("DELETE FROM {} WHERE {}", image.table, pk_predicate(image)),
        image.pk_values(row),
    )
}

fn restore_update(image: &RecordImage, row: &Row) -> (String, Vec<SqlValue>) {
    let non_pk: Vec<(usize, &String)> = image
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| !image.pk_columns.contains(c))
        .collect();
    let set_clause = non_pk
        .iter()
        .map(|(_, c)| format!("{} = ?", c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut params: Vec<SqlValue> = non_pk.iter().map(|(i, _)| row[*i].clone()).collect();
    params.extend(image.pk_values(row));
    (
        format!(
            "UPDATE {} SET {} WHERE {}",
            image.table,
            set_clause,
            pk_predicate(image)
        ),
        params,
    )
}

fn reinsert(image: &RecordImage, row: &Row) -> (String, Vec<SqlValue>) {
    let placeholders = vec!["?"; image.columns.len()].join(", ");
    (
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            image.table,
            image.columns.join(", "),
            placeholders
        ),
        row.clone(),
    )
}

fn parse_undo_row(row: &Row) -> TxResult<UndoLogRecord> {
    let get_int = |index: usize| -> TxResult<i64> {
        match row.get(index) {
            Some(SqlValue::Integer(v)) => Ok(*v),
            other => Err(TxError::new(
                ErrorKind::Internal,
                format!("undo column {} is not an integer: {:?}", index, other),
            )),
        }
    };
    let get_text = |index: usize| -> TxResult<String> {
        match row.get(index) {
            Some(SqlValue::Text(v)) => Ok(v.clone()),
            other => Err(TxError::new(
                ErrorKind::Internal,
                format!("undo column {} is not text: {:?}", index, other),
            )),
        }
    };

    let sql_type = match get_text(4)?.as_str() {
        "INSERT" => DmlType::Insert,
        "UPDATE" => DmlType::Update,
        "DELETE" => DmlType::Delete,
        other => {
            return Err(TxError::new(
                ErrorKind::Internal,
                format!("unknown undo sql_type {}", other),
            ))
        }
    };

    Ok(UndoLogRecord {
        id: get_int(0)?,
        xid: get_text(1)?,
        branch_id: BranchId::new(get_int(2)?),
        table_name: get_text(3)?,
        sql_type,
        before_image: serde_json::from_str(&get_text(5)?)?,
        after_image: serde_json::from_str(&get_text(6)?)?,
        sql_text: get_text(7)?,
        parameters: get_text(8)?,
        log_status: UndoStatus::from_i64(get_int(9)?),
        create_time_ms: get_int(10)?,
        update_time_ms: get_int(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TableMeta;

    async fn setup() -> (MemoryExecutor, UndoLogManager) {
        let executor = MemoryExecutor::new();
        executor
            .create_table("account", &["id", "balance"], &["id"])
            .await;
        UndoLogManager::install(&executor).await;
        (executor, UndoLogManager::new())
    }

    fn account_meta() -> TableMeta {
        TableMeta {
            name: "account".to_string(),
            columns: vec!["id".to_string(), "balance".to_string()],
            pk_columns: vec!["id".to_string()],
        }
    }

    async fn write_with_undo(
        executor: &MemoryExecutor,
        undo: &UndoLogManager,
        xid: &str,
        branch: i64,
        sql_type: DmlType,
        before: RecordImage,
        after: RecordImage,
        dml: &str,
        params: &[SqlValue],
    ) {
        let mut tx = executor.begin_local().await.unwrap();
        tx.execute(dml, params).await.unwrap();
        undo.insert_undo_log(
            &mut tx,
            xid,
            BranchId::new(branch),
            sql_type,
            &before,
            &after,
            dml,
            params,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn update_compensation_restores_the_before_image() {
        let (executor, undo) = setup().await;
        executor
            .execute_autocommit(
                "INSERT INTO account (id, balance) VALUES (?, ?)",
                &[SqlValue::Integer(1), SqlValue::Integer(100)],
            )
            .await
            .unwrap();

        let meta = account_meta();
        let before = RecordImage::new(&meta, vec![vec![SqlValue::Integer(1), SqlValue::Integer(100)]]);
        let after = RecordImage::new(&meta, vec![vec![SqlValue::Integer(1), SqlValue::Integer(90)]]);
        write_with_undo(
            &executor,
            &undo,
            "svc:1:1",
            1001,
            DmlType::Update,
            before,
            after,
            "UPDATE account SET balance = balance - ? WHERE id = ?",
            &[SqlValue::Integer(10), SqlValue::Integer(1)],
        )
        .await;
        assert_eq!(executor.rows_of("account").await[0][1], SqlValue::Integer(90));

        undo.compensate(&executor, "svc:1:1", BranchId::new(1001), true)
            .await
            .unwrap();
        assert_eq!(executor.rows_of("account").await[0][1], SqlValue::Integer(100));
        assert!(executor.rows_of(UNDO_LOG_TABLE).await.is_empty());
    }

    #[tokio::test]
    async fn insert_compensation_deletes_the_row() {
        let (executor, undo) = setup().await;
        let meta = account_meta();
        let before = RecordImage::empty(&meta);
        let after = RecordImage::new(&meta, vec![vec![SqlValue::Integer(7), SqlValue::Integer(10)]]);
        write_with_undo(
            &executor,
            &undo,
            "svc:1:1",
            1002,
            DmlType::Insert,
            before,
            after,
            "INSERT INTO account (id, balance) VALUES (?, ?)",
            &[SqlValue::Integer(7), SqlValue::Integer(10)],
        )
        .await;

        undo.compensate(&executor, "svc:1:1", BranchId::new(1002), true)
            .await
            .unwrap();
        assert!(executor.rows_of("account").await.is_empty());
    }

    #[tokio::test]
    async fn delete_compensation_reinserts_the_before_image() {
        let (executor, undo) = setup().await;
        executor
            .execute_autocommit(
                "INSERT INTO account (id, balance) VALUES (?, ?)",
                &[SqlValue::Integer(3), SqlValue::Integer(55)],
            )
            .await
            .unwrap();

        let meta = account_meta();
        let before = RecordImage::new(&meta, vec![vec![SqlValue::Integer(3), SqlValue::Integer(55)]]);
        let after = RecordImage::empty(&meta);
        write_with_undo(
            &executor,
            &undo,
            "svc:1:1",
            1003,
            DmlType::Delete,
            before,
            after,
            "DELETE FROM account WHERE id = ?",
            &[SqlValue::Integer(3)],
        )
        .await;
        assert!(executor.rows_of("account").await.is_empty());

        undo.compensate(&executor, "svc:1:1", BranchId::new(1003), true)
            .await
            .unwrap();
        assert_eq!(
            executor.rows_of("account").await,
            vec![vec![SqlValue::Integer(3), SqlValue::Integer(55)]]
        );
    }

    #[tokio::test]
    async fn interleaved_write_aborts_with_dirty_write() {
        let (executor, undo) = setup().await;
        executor
            .execute_autocommit(
                "INSERT INTO account (id, balance) VALUES (?, ?)",
                &[SqlValue::Integer(1), SqlValue::Integer(100)],
            )
            .await
            .unwrap();

        let meta = account_meta();
        let before = RecordImage::new(&meta, vec![vec![SqlValue::Integer(1), SqlValue::Integer(100)]]);
        let after = RecordImage::new(&meta, vec![vec![SqlValue::Integer(1), SqlValue::Integer(90)]]);
        write_with_undo(
            &executor,
            &undo,
            "svc:1:1",
            1004,
            DmlType::Update,
            before,
            after,
            "UPDATE account SET balance = ? WHERE id = ?",
            &[SqlValue::Integer(90), SqlValue::Integer(1)],
        )
        .await;

        // a non-AT writer changes the row under the transaction
        executor
            .execute_autocommit(
                "UPDATE account SET balance = ? WHERE id = ?",
                &[SqlValue::Integer(42), SqlValue::Integer(1)],
            )
            .await
            .unwrap();

        let err = undo
            .compensate(&executor, "svc:1:1", BranchId::new(1004), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DirtyWrite);
        // the dirty value stands and the undo log is preserved for the operator
        assert_eq!(executor.rows_of("account").await[0][1], SqlValue::Integer(42));
        assert_eq!(executor.rows_of(UNDO_LOG_TABLE).await.len(), 1);
    }

    #[tokio::test]
    async fn missing_log_policy_follows_phase_one_outcome() {
        let (executor, undo) = setup().await;
        // phase-1 never completed: success
        undo.compensate(&executor, "svc:9:9", BranchId::new(9), false)
            .await
            .unwrap();
        // phase-1 reported done but the log is gone: failure
        let err = undo
            .compensate(&executor, "svc:9:9", BranchId::new(9), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoUndoLog);
    }

    #[tokio::test]
    async fn commit_cleanup_deletes_only_this_branch() {
        let (executor, undo) = setup().await;
        let meta = account_meta();
        let image = RecordImage::new(&meta, vec![vec![SqlValue::Integer(1), SqlValue::Integer(1)]]);
        write_with_undo(
            &executor,
            &undo,
            "svc:1:1",
            1,
            DmlType::Insert,
            RecordImage::empty(&meta),
            image.clone(),
            "INSERT INTO account (id, balance) VALUES (?, ?)",
            &[SqlValue::Integer(1), SqlValue::Integer(1)],
        )
        .await;
        let meta2 = account_meta();
        write_with_undo(
            &executor,
            &undo,
            "svc:1:2",
            2,
            DmlType::Insert,
            RecordImage::empty(&meta2),
            RecordImage::new(&meta2, vec![vec![SqlValue::Integer(2), SqlValue::Integer(2)]]),
            "INSERT INTO account (id, balance) VALUES (?, ?)",
            &[SqlValue::Integer(2), SqlValue::Integer(2)],
        )
        .await;

        let deleted = undo
            .delete_undo_logs(&executor, "svc:1:1", BranchId::new(1))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(executor.rows_of(UNDO_LOG_TABLE).await.len(), 1);
    }
}
