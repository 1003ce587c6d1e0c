//! End-to-end lifecycle tests: a real coordinator behind a TCP socket, a
//! real client, the AT interceptor against an in-memory business database,
//! and TCC services — the full span from `begin` to phase-2 outcome.

use client::TcClient;
use common::config::{LockConfig, MaxAttempts, RetryConfig, TxConfig};
use common::{BranchStatus, BranchType, ErrorKind, GlobalStatus, TxContext, TxResult};
use coordinator::{Coordinator, CoordinatorRef, TcServer, TimeoutScanner};
use datasource::{DmlInterceptor, MemoryExecutor, SqlExecutor, SqlValue, UndoLogManager};
use resource::dispatch::BranchDispatcher;
use resource::{AtResourceHandler, TccInvocation, TccRegistry, TccResourceHandler, TccService};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use store::TransactionStore;
use tokio::net::TcpListener;

struct Harness {
    coordinator: CoordinatorRef,
    executor: MemoryExecutor,
    tcc_registry: Arc<TccRegistry>,
    address: String,
}

struct InventoryService {
    confirms: AtomicU32,
    cancels: AtomicU32,
}

#[async_trait::async_trait]
impl TccService for InventoryService {
    fn resource_id(&self) -> &str {
        "inv"
    }

    async fn confirm(&self, _invocation: &TccInvocation) -> TxResult<bool> {
        self.confirms.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn cancel(&self, _invocation: &TccInvocation) -> TxResult<bool> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

fn fast_config() -> TxConfig {
    TxConfig::builder()
        .lock(
            LockConfig::builder()
                .retry_interval_ms(1)
                .max_retries(3)
                .build(),
        )
        .retry(
            RetryConfig::builder()
                .initial_interval_ms(2)
                .max_interval_ms(5)
                .max_attempts(MaxAttempts::default())
                .build(),
        )
        .build()
}

async fn boot() -> Harness {
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

    let at_handler = AtResourceHandler::new(Arc::new(UndoLogManager::new()));
    at_handler.register_resource("rm-orders", Arc::new(executor.clone()));

    let tcc_registry = Arc::new(TccRegistry::new());
    tcc_registry.register(
        Arc::new(InventoryService {
            confirms: AtomicU32::new(0),
            cancels: AtomicU32::new(0),
        }),
        Default::default(),
    );

    let config = fast_config();
    let dispatcher = BranchDispatcher::shared(config.retry().clone());
    dispatcher.register_handler(Arc::new(at_handler));
    dispatcher.register_handler(Arc::new(TccResourceHandler::new(tcc_registry.clone())));

    let coordinator = Coordinator::shared(
        config,
        store::MemoryStore::shared(),
        store::LockManager::shared(),
        dispatcher,
    );

    let server = TcServer::new(coordinator.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("{}", listener.local_addr().unwrap());
    tokio::spawn(server.accept_connections(listener));

    Harness {
        coordinator,
        executor,
        tcc_registry,
        address,
    }
}

fn interceptor(harness: &Harness, client: Arc<TcClient>) -> DmlInterceptor {
    DmlInterceptor::new(
        "rm-orders",
        Arc::new(harness.executor.clone()),
        client,
        Arc::new(UndoLogManager::new()),
    )
}

fn ctx_for(xid: &str) -> TxContext {
    let mut ctx = TxContext::unbound();
    ctx.bind(xid);
    ctx
}

async fn run_business_dml(harness: &Harness, interceptor: &DmlInterceptor, xid: &str) {
    interceptor
        .execute(
            &ctx_for(xid),
            "UPDATE account SET balance = balance - ? WHERE id = ?",
            &[SqlValue::Integer(10), SqlValue::Integer(1)],
        )
        .await
        .unwrap();
    interceptor
        .execute(
            &ctx_for(xid),
            "INSERT INTO ledger (id, amount) VALUES (?, ?)",
            &[SqlValue::Integer(7), SqlValue::Integer(10)],
        )
        .await
        .unwrap();
    assert_eq!(
        harness.executor.rows_of("account").await[0][1],
        SqlValue::Integer(90)
    );
}

#[tokio::test]
async fn happy_at_commit_cleans_up_everything() {
    let harness = boot().await;
    let client = TcClient::connect(&harness.address).await.unwrap();

    let xid = client.begin_global("svc", "order-pay", 10_000).await.unwrap();
    assert!(xid.starts_with("svc:"));

    let interceptor = interceptor(&harness, client.clone());
    run_business_dml(&harness, &interceptor, &xid).await;

    // two branches enlisted, locks held
    let branches = harness.coordinator.store().branches_of(&xid).await.unwrap();
    assert_eq!(branches.len(), 2);
    assert_eq!(harness.coordinator.locks().len(), 2);

    let status = client.commit_global(&xid).await.unwrap();
    assert_eq!(status, GlobalStatus::Committed);

    // business effects stand, undo rows deleted, locks released
    assert_eq!(
        harness.executor.rows_of("account").await[0][1],
        SqlValue::Integer(90)
    );
    assert_eq!(harness.executor.rows_of("ledger").await.len(), 1);
    assert!(harness
        .executor
        .rows_of(datasource::undo::UNDO_LOG_TABLE)
        .await
        .is_empty());
    assert!(harness.coordinator.locks().is_empty());

    for branch in harness.coordinator.store().branches_of(&xid).await.unwrap() {
        assert_eq!(branch.status, BranchStatus::PhaseTwoCommitted);
    }
}

#[tokio::test]
async fn rollback_restores_the_original_table_state() {
    let harness = boot().await;
    let client = TcClient::connect(&harness.address).await.unwrap();

    let xid = client.begin_global("svc", "order-pay", 10_000).await.unwrap();
    let interceptor = interceptor(&harness, client.clone());
    run_business_dml(&harness, &interceptor, &xid).await;

    // the business throws; the TM rolls back
    let status = client.rollback_global(&xid).await.unwrap();
    assert_eq!(status, GlobalStatus::Rollbacked);

    // reverse SQL ran: balance restored, inserted ledger row deleted
    assert_eq!(
        harness.executor.rows_of("account").await,
        vec![vec![SqlValue::Integer(1), SqlValue::Integer(100)]]
    );
    assert!(harness.executor.rows_of("ledger").await.is_empty());
    assert!(harness
        .executor
        .rows_of(datasource::undo::UNDO_LOG_TABLE)
        .await
        .is_empty());
    assert!(harness.coordinator.locks().is_empty());

    for branch in harness.coordinator.store().branches_of(&xid).await.unwrap() {
        assert_eq!(branch.status, BranchStatus::PhaseTwoRollbacked);
    }
}

#[tokio::test]
async fn competing_transactions_conflict_on_the_same_row() {
    let harness = boot().await;
    let client = TcClient::connect(&harness.address).await.unwrap();
    let interceptor = interceptor(&harness, client.clone());

    let first = client.begin_global("svc", "order-pay", 10_000).await.unwrap();
    interceptor
        .execute(
            &ctx_for(&first),
            "UPDATE account SET balance = balance - ? WHERE id = ?",
            &[SqlValue::Integer(10), SqlValue::Integer(1)],
        )
        .await
        .unwrap();

    // second transaction targets the same row and exhausts its lock retries
    let second = client.begin_global("svc", "order-pay", 10_000).await.unwrap();
    let err = interceptor
        .execute(
            &ctx_for(&second),
            "UPDATE account SET balance = balance - ? WHERE id = ?",
            &[SqlValue::Integer(5), SqlValue::Integer(1)],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockConflict);
    assert!(err.is_retryable());

    // its local write was rolled back
    assert_eq!(
        harness.executor.rows_of("account").await[0][1],
        SqlValue::Integer(90)
    );

    // once the holder terminates, the row frees up
    client.rollback_global(&first).await.unwrap();
    let third = client.begin_global("svc", "order-pay", 10_000).await.unwrap();
    interceptor
        .execute(
            &ctx_for(&third),
            "UPDATE account SET balance = balance - ? WHERE id = ?",
            &[SqlValue::Integer(5), SqlValue::Integer(1)],
        )
        .await
        .unwrap();
    client.commit_global(&third).await.unwrap();
    assert_eq!(
        harness.executor.rows_of("account").await[0][1],
        SqlValue::Integer(95)
    );
}

#[tokio::test]
async fn timed_out_transaction_rejects_the_late_commit() {
    let harness = boot().await;
    let client = TcClient::connect(&harness.address).await.unwrap();

    let xid = client.begin_global("svc", "slow-job", 2_000).await.unwrap();

    // the business sleeps past its deadline; rewind the clock instead
    let store = harness.coordinator.store();
    let mut global = store.global(&xid).await.unwrap().unwrap();
    global.begin_time_ms = 0;
    store.insert_global(global).await.unwrap();

    TimeoutScanner::new(harness.coordinator.clone()).tick().await;
    assert_eq!(
        client.global_status(&xid).await.unwrap(),
        GlobalStatus::TimeoutRollbacked
    );

    let err = client.commit_global(&xid).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GlobalNotActive);
}

#[tokio::test]
async fn tcc_branch_confirms_through_the_registry() {
    let harness = boot().await;
    let client = TcClient::connect(&harness.address).await.unwrap();

    let xid = client.begin_global("svc", "reserve-stock", 10_000).await.unwrap();
    let branch_id = client
        .register_branch(&xid, "inv", BranchType::TCC, None, None)
        .await
        .unwrap();
    // Try runs in the business service
    harness.tcc_registry.mark_tried(&xid, branch_id).unwrap();
    client
        .report_branch(&xid, branch_id, BranchStatus::PhaseOneDone)
        .await
        .unwrap();

    let status = client.commit_global(&xid).await.unwrap();
    assert_eq!(status, GlobalStatus::Committed);

    let branch = harness.coordinator.store().branch(branch_id).await.unwrap().unwrap();
    assert_eq!(branch.status, BranchStatus::PhaseTwoCommitted);
}

#[tokio::test]
async fn phase_two_is_idempotent_over_the_wire() {
    let harness = boot().await;
    let client = TcClient::connect(&harness.address).await.unwrap();

    let xid = client.begin_global("svc", "order-pay", 10_000).await.unwrap();
    let interceptor = interceptor(&harness, client.clone());
    interceptor
        .execute(
            &ctx_for(&xid),
            "UPDATE account SET balance = balance - ? WHERE id = ?",
            &[SqlValue::Integer(10), SqlValue::Integer(1)],
        )
        .await
        .unwrap();

    assert_eq!(client.commit_global(&xid).await.unwrap(), GlobalStatus::Committed);
    // the second commit returns the final status without re-driving
    assert_eq!(client.commit_global(&xid).await.unwrap(), GlobalStatus::Committed);
    assert_eq!(
        harness.executor.rows_of("account").await[0][1],
        SqlValue::Integer(90)
    );
}

#[tokio::test]
async fn transaction_scope_commits_on_success_and_rolls_back_on_error() {
    let harness = boot().await;
    let client = TcClient::connect(&harness.address).await.unwrap();
    let scope = client::GlobalTransactionScope::new(client.clone(), "svc");
    let interceptor = Arc::new(interceptor(&harness, client.clone()));

    // success path: the wrapper commits for us
    let debit = interceptor.clone();
    let value = scope
        .execute("order-pay", 10_000, |ctx| async move {
            debit
                .execute(
                    &ctx,
                    "UPDATE account SET balance = balance - ? WHERE id = ?",
                    &[SqlValue::Integer(10), SqlValue::Integer(1)],
                )
                .await?;
            Ok(42)
        })
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(
        harness.executor.rows_of("account").await[0][1],
        SqlValue::Integer(90)
    );

    // failure path: the business error triggers rollback and comes back out
    let debit = interceptor.clone();
    let err = scope
        .execute("order-pay", 10_000, |ctx| async move {
            debit
                .execute(
                    &ctx,
                    "UPDATE account SET balance = balance - ? WHERE id = ?",
                    &[SqlValue::Integer(40), SqlValue::Integer(1)],
                )
                .await?;
            Err::<u32, _>(common::TxError::new(ErrorKind::Internal, "business exploded"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(
        harness.executor.rows_of("account").await[0][1],
        SqlValue::Integer(90)
    );
    assert!(harness.coordinator.locks().is_empty());
}

#[tokio::test]
async fn branch_registration_against_unknown_xid_is_rejected() {
    let harness = boot().await;
    let client = TcClient::connect(&harness.address).await.unwrap();

    let err = client
        .register_branch("svc:0:404", "inv", BranchType::TCC, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GlobalNotFound);
    drop(harness);
}
