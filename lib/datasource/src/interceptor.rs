//! The DML interception pipeline: analyze, snapshot, execute, snapshot
//! again, enlist the branch, persist the undo log — all inside the business
//! statement's own local transaction. A branch-registration failure (most
//! commonly a global-lock conflict) rolls the local transaction back and
//! surfaces as a retryable error to the business code.

use crate::executor::{LocalTransaction, Row, SqlExecutor, SqlValue};
use crate::image::RecordImage;
use crate::sql::{analyze, DmlInfo, DmlType};
use crate::undo::UndoLogManager;
use async_trait::async_trait;
use common::{BranchId, BranchStatus, BranchType, ErrorKind, TxContext, TxError, TxResult};
use getset::Getters;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use typed_builder::TypedBuilder;

/// What the interceptor sends upstream to enlist a branch. The client maps
/// this onto the wire; in-process deployments hand it to the coordinator
/// directly.
#[derive(Debug, Clone, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct BranchRegistration {
    pub xid: String,
    pub resource_id: String,
    pub branch_type: BranchType,
    #[builder(default)]
    pub lock_key: Option<String>,
    #[builder(default)]
    pub application_data: Option<String>,
}

/// Upstream seam for branch enlistment and phase-1 reporting.
#[async_trait]
pub trait BranchRegistrar: Send + Sync {
    async fn register_branch(&self, registration: BranchRegistration) -> TxResult<BranchId>;

    async fn report_branch(
        &self,
        xid: &str,
        branch_id: BranchId,
        status: BranchStatus,
    ) -> TxResult<()>;
}

/// Wraps a business data source. Only DML under an active global
/// transaction is intercepted; everything else passes straight through.
pub struct DmlInterceptor {
    resource_id: String,
    executor: Arc<dyn SqlExecutor>,
    registrar: Arc<dyn BranchRegistrar>,
    undo: Arc<UndoLogManager>,
}

impl DmlInterceptor {
    pub fn new(
        resource_id: impl Into<String>,
        executor: Arc<dyn SqlExecutor>,
        registrar: Arc<dyn BranchRegistrar>,
        undo: Arc<UndoLogManager>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            executor,
            registrar,
            undo,
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Read path: never intercepted.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> TxResult<Vec<Row>> {
        self.executor.query_autocommit(sql, params).await
    }

    /// Write path. Returns the affected row count of the business DML.
    #[instrument(skip(self, ctx, params), fields(resource = %self.resource_id))]
    pub async fn execute(
        &self,
        ctx: &TxContext,
        sql: &str,
        params: &[SqlValue],
    ) -> TxResult<u64> {
        let info = match analyze(sql)? {
            Some(info) => info,
            // not a supported DML
            None => return self.executor.execute_autocommit(sql, params).await,
        };
        let xid = match ctx.xid() {
            Some(xid) => xid.clone(),
            // no global transaction bound
            None => return self.executor.execute_autocommit(sql, params).await,
        };
        self.execute_intercepted(&xid, &info, sql, params).await
    }

    async fn execute_intercepted(
        &self,
        xid: &str,
        info: &DmlInfo,
        sql: &str,
        params: &[SqlValue],
    ) -> TxResult<u64> {
        let meta = self.executor.table_meta(&info.table).await?;
        let mut tx = self.executor.begin_local().await?;

        let before_image = match info.sql_type {
            DmlType::Insert => RecordImage::empty(&meta),
            DmlType::Update | DmlType::Delete => {
                let rows = tx
                    .query(&info.image_query(), info.where_params(params))
                    .await?;
                RecordImage::new(&meta, rows)
            }
        };

        let affected = match tx.execute(sql, params).await {
            Ok(affected) => affected,
            Err(err) => {
                tx.rollback().await?;
                return Err(err);
            }
        };

        let after_image = match self
            .capture_after_image(&mut tx, info, &before_image, params)
            .await
        {
            Ok(image) => image,
            Err(err) => {
                tx.rollback().await?;
                return Err(err);
            }
        };

        // lock keys cover every primary key the statement touched
        let keyed_image = match info.sql_type {
            DmlType::Insert => &after_image,
            DmlType::Update | DmlType::Delete => &before_image,
        };
        let registration = BranchRegistration::builder()
            .xid(xid.to_string())
            .resource_id(self.resource_id.clone())
            .branch_type(BranchType::AT)
            .lock_key(keyed_image.lock_key())
            .build();

        let branch_id = match self.registrar.register_branch(registration).await {
            Ok(branch_id) => branch_id,
            Err(err) => {
                // lock conflict or coordinator rejection: the business local
                // transaction must not survive
                tx.rollback().await?;
                debug!(xid, error = %err, "branch registration failed, local transaction aborted");
                return Err(err);
            }
        };

        if let Err(err) = self
            .undo
            .insert_undo_log(
                &mut tx,
                xid,
                branch_id,
                info.sql_type,
                &before_image,
                &after_image,
                sql,
                params,
            )
            .await
        {
            tx.rollback().await?;
            self.report(xid, branch_id, BranchStatus::PhaseOneFailed).await;
            return Err(err);
        }

        if let Err(err) = tx.commit().await {
            self.report(xid, branch_id, BranchStatus::PhaseOneFailed).await;
            return Err(err);
        }

        self.report(xid, branch_id, BranchStatus::PhaseOneDone).await;
        Ok(affected)
    }

    /// A failed report is not fatal: a `Registered` branch is still
    /// phase-two eligible, so the outcome only costs the coordinator
    /// information, not correctness.
    async fn report(&self, xid: &str, branch_id: BranchId, status: BranchStatus) {
        if let Err(err) = self.registrar.report_branch(xid, branch_id, status).await {
            warn!(xid, %branch_id, %status, error = %err, "phase-1 report failed");
        }
    }

    async fn capture_after_image(
        &self,
        tx: &mut Box<dyn LocalTransaction>,
        info: &DmlInfo,
        before_image: &RecordImage,
        params: &[SqlValue],
    ) -> TxResult<RecordImage> {
        match info.sql_type {
            // deleted rows have no after state; verification later checks
            // the keys stayed gone
            DmlType::Delete => Ok(RecordImage::with_layout(before_image, Vec::new())),
            DmlType::Update => {
                let mut rows = Vec::with_capacity(before_image.rows.len());
                for row in &before_image.rows {
                    if let Some(current) = fetch_by_pk(tx, before_image, row).await? {
                        rows.push(current);
                    }
                }
                Ok(RecordImage::with_layout(before_image, rows))
            }
            DmlType::Insert => {
                let pk_rows = self.inserted_pk_rows(info, before_image, params)?;
                let mut rows = Vec::with_capacity(pk_rows.len());
                for pk_values in &pk_rows {
                    if let Some(current) =
                        fetch_by_pk_values(tx, before_image, pk_values).await?
                    {
                        rows.push(current);
                    }
                }
                Ok(RecordImage::with_layout(before_image, rows))
            }
        }
    }

    /// Primary-key values of each inserted row, extracted from the
    /// statement itself. AT mode requires the key in the column list; rows
    /// relying on database-generated keys are rejected here.
    fn inserted_pk_rows(
        &self,
        info: &DmlInfo,
        image: &RecordImage,
        params: &[SqlValue],
    ) -> TxResult<Vec<Vec<SqlValue>>> {
        let column_names: &[String] = if info.insert_columns.is_empty() {
            &image.columns
        } else {
            &info.insert_columns
        };
        let pk_positions: Vec<usize> = image
            .pk_columns
            .iter()
            .map(|pk| {
                column_names.iter().position(|c| c == pk).ok_or_else(|| {
                    TxError::new(
                        ErrorKind::UnsupportedSql,
                        format!("AT INSERT into {} must list primary key {}", image.table, pk),
                    )
                })
            })
            .collect::<TxResult<_>>()?;

        info.insert_values
            .iter()
            .map(|cells| {
                pk_positions
                    .iter()
                    .map(|position| {
                        cells
                            .get(*position)
                            .ok_or_else(|| {
                                TxError::new(ErrorKind::UnsupportedSql, "VALUES arity mismatch")
                            })?
                            .resolve(params)
                    })
                    .collect()
            })
            .collect()
    }
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
    fetch_by_pk_values(tx, image, &image.pk_values(row)).await
}

async fn fetch_by_pk_values(
    tx: &mut Box<dyn LocalTransaction>,
    image: &RecordImage,
    pk_values: &[SqlValue],
) -> TxResult<Option<Row>> {
    let sql = format!("SELECT * FROM {} WHERE {}", image.table, pk_predicate(image));
    let mut rows = tx.query(&sql, pk_values).await?;
    Ok(if rows.is_empty() {
        None
    } else {
        Some(rows.remove(0))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemoryExecutor;
    use crate::undo::{UndoLogManager, UNDO_LOG_TABLE};
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Registrar double: hands out sequential branch ids and records calls.
    #[derive(Default)]
    struct RecordingRegistrar {
        next_id: AtomicI64,
        registrations: DashMap<i64, BranchRegistration>,
        reports: DashMap<i64, BranchStatus>,
        reject_with: Option<ErrorKind>,
    }

    impl RecordingRegistrar {
        fn rejecting(kind: ErrorKind) -> Self {
            Self {
                reject_with: Some(kind),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl BranchRegistrar for RecordingRegistrar {
        async fn register_branch(
            &self,
            registration: BranchRegistration,
        ) -> TxResult<BranchId> {
            if let Some(kind) = self.reject_with {
                return Err(TxError::new(kind, "rejected by test"));
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1001;
            self.registrations.insert(id, registration);
            Ok(BranchId::new(id))
        }

        async fn report_branch(
            &self,
            _xid: &str,
            branch_id: BranchId,
            status: BranchStatus,
        ) -> TxResult<()> {
            self.reports.insert(branch_id.as_i64(), status);
            Ok(())
        }
    }

    async fn setup() -> (MemoryExecutor, Arc<RecordingRegistrar>, DmlInterceptor) {
        let executor = MemoryExecutor::new();
        executor
            .create_table("account", &["id", "balance"], &["id"])
            .await;
        executor
            .create_table("ledger", &["id", "amount"], &["id"])
            .await;
        UndoLogManager::install(&executor).await;
        executor
            .execute_autocommit(
                "INSERT INTO account (id, balance) VALUES (?, ?)",
                &[SqlValue::Integer(1), SqlValue::Integer(100)],
            )
            .await
            .unwrap();

        let registrar = Arc::new(RecordingRegistrar::default());
        let interceptor = DmlInterceptor::new(
            "rm-orders",
            Arc::new(executor.clone()),
            registrar.clone(),
            Arc::new(UndoLogManager::new()),
        );
        (executor, registrar, interceptor)
    }

    fn bound_ctx() -> TxContext {
        let mut ctx = TxContext::unbound();
        ctx.bind("svc:1700000000000:1");
        ctx
    }

    #[tokio::test]
    async fn update_writes_undo_log_and_registers_branch() {
        let (executor, registrar, interceptor) = setup().await;

        let affected = interceptor
            .execute(
                &bound_ctx(),
                "UPDATE account SET balance = balance - ? WHERE id = ?",
                &[SqlValue::Integer(10), SqlValue::Integer(1)],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(executor.rows_of("account").await[0][1], SqlValue::Integer(90));

        let registration = registrar.registrations.get(&1001).unwrap();
        assert_eq!(registration.lock_key.as_deref(), Some("account:1"));
        assert_eq!(registration.branch_type, BranchType::AT);
        assert_eq!(
            registrar.reports.get(&1001).map(|r| *r.value()),
            Some(BranchStatus::PhaseOneDone)
        );
        assert_eq!(executor.rows_of(UNDO_LOG_TABLE).await.len(), 1);
    }

    #[tokio::test]
    async fn insert_lock_key_comes_from_the_inserted_rows() {
        let (executor, registrar, interceptor) = setup().await;

        interceptor
            .execute(
                &bound_ctx(),
                "INSERT INTO ledger (id, amount) VALUES (7, ?)",
                &[SqlValue::Integer(10)],
            )
            .await
            .unwrap();

        let registration = registrar.registrations.get(&1001).unwrap();
        assert_eq!(registration.lock_key.as_deref(), Some("ledger:7"));
        assert_eq!(executor.rows_of("ledger").await.len(), 1);
    }

    #[tokio::test]
    async fn lock_conflict_rolls_back_the_local_transaction() {
        let executor = MemoryExecutor::new();
        executor
            .create_table("account", &["id", "balance"], &["id"])
            .await;
        UndoLogManager::install(&executor).await;
        executor
            .execute_autocommit(
                "INSERT INTO account (id, balance) VALUES (?, ?)",
                &[SqlValue::Integer(1), SqlValue::Integer(100)],
            )
            .await
            .unwrap();

        let registrar = Arc::new(RecordingRegistrar::rejecting(ErrorKind::LockConflict));
        let interceptor = DmlInterceptor::new(
            "rm-orders",
            Arc::new(executor.clone()),
            registrar,
            Arc::new(UndoLogManager::new()),
        );

        let err = interceptor
            .execute(
                &bound_ctx(),
                "UPDATE account SET balance = ? WHERE id = ?",
                &[SqlValue::Integer(0), SqlValue::Integer(1)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
        assert!(err.is_retryable());

        // the business write was discarded with the local transaction
        assert_eq!(executor.rows_of("account").await[0][1], SqlValue::Integer(100));
        assert!(executor.rows_of(UNDO_LOG_TABLE).await.is_empty());
    }

    #[tokio::test]
    async fn no_transaction_in_context_bypasses_interception() {
        let (executor, registrar, interceptor) = setup().await;

        interceptor
            .execute(
                &TxContext::unbound(),
                "UPDATE account SET balance = ? WHERE id = ?",
                &[SqlValue::Integer(5), SqlValue::Integer(1)],
            )
            .await
            .unwrap();

        assert!(registrar.registrations.is_empty());
        assert!(executor.rows_of(UNDO_LOG_TABLE).await.is_empty());
        assert_eq!(executor.rows_of("account").await[0][1], SqlValue::Integer(5));
    }

    #[tokio::test]
    async fn batch_insert_captures_one_image_per_row() {
        let (executor, registrar, interceptor) = setup().await;

        interceptor
            .execute(
                &bound_ctx(),
                "INSERT INTO ledger (id, amount) VALUES (?, ?), (?, ?)",
                &[
                    SqlValue::Integer(7),
                    SqlValue::Integer(10),
                    SqlValue::Integer(8),
                    SqlValue::Integer(20),
                ],
            )
            .await
            .unwrap();

        let registration = registrar.registrations.get(&1001).unwrap();
        assert_eq!(registration.lock_key.as_deref(), Some("ledger:7,8"));
        // one undo row per statement, two rows in its after-image
        assert_eq!(executor.rows_of(UNDO_LOG_TABLE).await.len(), 1);
    }
}
