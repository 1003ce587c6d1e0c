//! Background timeout scanner: every tick it marks expired branches,
//! rolls back expired global transactions and purges terminal records past
//! their retention grace.

use crate::core::CoordinatorRef;
use common::util::time::now_ms;
use common::{BranchStatus, GlobalStatus};
use store::TransactionStore;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

pub struct TimeoutScanner {
    coordinator: CoordinatorRef,
}

impl TimeoutScanner {
    pub fn new(coordinator: CoordinatorRef) -> Self {
        Self { coordinator }
    }

    /// Spawns the periodic task. Interval and retention come from the
    /// coordinator's configuration.
    pub fn spawn(self) -> JoinHandle<()> {
        let interval = Duration::from_millis(*self.coordinator.config().scan().interval_ms());
        info!(?interval, "timeout scanner started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick fires immediately; skip it so a fresh server
            // does not scan an empty store
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    /// One scan pass, callable directly by tests.
    #[instrument(skip(self))]
    pub async fn tick(&self) {
        let now = now_ms();
        let store = self.coordinator.store().clone();

        match store.expired_branches(now).await {
            Ok(branches) => {
                for branch in branches {
                    debug!(branch = %branch.branch_id, xid = %branch.xid, "branch timed out");
                    if let Err(err) = store
                        .update_branch_status(branch.branch_id, BranchStatus::Timeout)
                        .await
                    {
                        error!(branch = %branch.branch_id, error = %err, "failed to mark branch timeout");
                    }
                }
            }
            Err(err) => error!(error = %err, "branch expiry scan failed"),
        }

        match store.expired_globals(now).await {
            Ok(globals) => {
                for global in globals {
                    if global.status != GlobalStatus::Begin {
                        continue; // phase-2 already owns it
                    }
                    match self.coordinator.timeout_rollback(&global.xid).await {
                        Ok(status) => {
                            debug!(xid = %global.xid, %status, "timeout rollback driven")
                        }
                        Err(err) => {
                            error!(xid = %global.xid, error = %err, "timeout rollback failed")
                        }
                    }
                }
            }
            Err(err) => error!(error = %err, "global expiry scan failed"),
        }

        let grace = *self.coordinator.config().retention().grace_ms();
        match store.purge_finished(grace).await {
            Ok(purged) if purged > 0 => debug!(purged, "terminal records purged"),
            Ok(_) => {}
            Err(err) => error!(error = %err, "retention purge failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Coordinator;
    use common::config::{MaxAttempts, RetryConfig, TxConfig};
    use common::{BranchType, ErrorKind};
    use resource::dispatch::{BranchDispatcher, CommunicationResult, ResourceHandler};
    use std::sync::Arc;
    use store::{BranchTransaction, LockManager, MemoryStore};

    struct AlwaysOk;

    #[async_trait::async_trait]
    impl ResourceHandler for AlwaysOk {
        fn branch_type(&self) -> BranchType {
            BranchType::TCC
        }

        async fn commit(&self, _branch: &BranchTransaction) -> CommunicationResult {
            CommunicationResult::success()
        }

        async fn rollback(&self, _branch: &BranchTransaction) -> CommunicationResult {
            CommunicationResult::success()
        }
    }

    fn scanner() -> (CoordinatorRef, TimeoutScanner) {
        let config = TxConfig::builder()
            .retry(
                RetryConfig::builder()
                    .initial_interval_ms(1)
                    .max_interval_ms(2)
                    .max_attempts(MaxAttempts::default())
                    .build(),
            )
            .build();
        let dispatcher = BranchDispatcher::shared(config.retry().clone());
        dispatcher.register_handler(Arc::new(AlwaysOk));
        let coordinator = Coordinator::shared(
            config,
            MemoryStore::shared(),
            LockManager::shared(),
            dispatcher,
        );
        (coordinator.clone(), TimeoutScanner::new(coordinator))
    }

    async fn expire_global(coordinator: &CoordinatorRef, xid: &str) {
        // rewind the begin time instead of sleeping through the timeout
        let store = coordinator.store();
        let mut global = store.global(xid).await.unwrap().unwrap();
        global.begin_time_ms = 0;
        store.insert_global(global).await.unwrap();
    }

    #[tokio::test]
    async fn expired_globals_are_rolled_back_by_the_next_tick() {
        let (coordinator, scanner) = scanner();
        let xid = coordinator.begin("svc", "order-pay", 2_000).await.unwrap();
        coordinator
            .register_branch(&xid, "inv", BranchType::TCC, None, None)
            .await
            .unwrap();
        expire_global(&coordinator, &xid).await;

        scanner.tick().await;

        assert_eq!(
            coordinator.global_status(&xid).await.unwrap(),
            common::GlobalStatus::TimeoutRollbacked
        );

        // the business thread's late commit is rejected
        let err = coordinator.global_commit(&xid).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GlobalNotActive);
    }

    #[tokio::test]
    async fn live_transactions_survive_a_tick() {
        let (coordinator, scanner) = scanner();
        let xid = coordinator.begin("svc", "order-pay", 60_000).await.unwrap();

        scanner.tick().await;

        assert_eq!(
            coordinator.global_status(&xid).await.unwrap(),
            common::GlobalStatus::Begin
        );
    }

    #[tokio::test]
    async fn expired_branches_are_marked_timeout() {
        let (coordinator, scanner) = scanner();
        let xid = coordinator.begin("svc", "order-pay", 60_000).await.unwrap();
        let branch_id = coordinator
            .register_branch(&xid, "inv", BranchType::TCC, None, None)
            .await
            .unwrap();

        // rewind the branch clock past its timeout
        let store = coordinator.store();
        let mut branch = store.branch(branch_id).await.unwrap().unwrap();
        branch.begin_time_ms = 0;
        store.insert_branch(branch).await.unwrap();

        scanner.tick().await;

        let branch = store.branch(branch_id).await.unwrap().unwrap();
        assert_eq!(branch.status, BranchStatus::Timeout);
    }
}
