use crate::records::{BranchTransaction, GlobalTransaction};
use async_trait::async_trait;
use common::util::time::now_ms;
use common::{BranchId, BranchStatus, ErrorKind, GlobalStatus, TxError, TxResult};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

pub type StoreRef = Arc<dyn TransactionStore>;

/// Persistence seam of the coordinator. Status updates are guarded by the
/// transition tables; an update that the state machine forbids is rejected
/// here so no caller can corrupt a record.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert_global(&self, tx: GlobalTransaction) -> TxResult<()>;

    async fn global(&self, xid: &str) -> TxResult<Option<GlobalTransaction>>;

    /// Applies `next` if the transition table allows it. Repeating the
    /// current status is a no-op (idempotent re-application).
    async fn update_global_status(&self, xid: &str, next: GlobalStatus) -> TxResult<()>;

    async fn remove_global(&self, xid: &str) -> TxResult<()>;

    async fn insert_branch(&self, branch: BranchTransaction) -> TxResult<()>;

    async fn branch(&self, branch_id: BranchId) -> TxResult<Option<BranchTransaction>>;

    async fn branches_of(&self, xid: &str) -> TxResult<Vec<BranchTransaction>>;

    /// Forward-only: a repeated or backward report is discarded, not an
    /// error.
    async fn update_branch_status(&self, branch_id: BranchId, next: BranchStatus)
        -> TxResult<bool>;

    /// Non-terminal globals whose timeout elapsed at `now`.
    async fn expired_globals(&self, now: u64) -> TxResult<Vec<GlobalTransaction>>;

    /// Non-terminal, non-Timeout branches whose branch timeout elapsed.
    async fn expired_branches(&self, now: u64) -> TxResult<Vec<BranchTransaction>>;

    /// Branches stuck in a phase-two failed state, for operator review.
    async fn failed_branches(&self) -> TxResult<Vec<BranchTransaction>>;

    /// Drops terminal globals (and their branches) older than the grace
    /// window. Returns how many globals were purged.
    async fn purge_finished(&self, grace_ms: u64) -> TxResult<usize>;
}

/// In-memory store over concurrent maps. The bundled implementation for
/// single-node deployments and tests; a relational implementation maps the
/// same trait onto the DDL in [`crate::schema`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    globals: DashMap<String, GlobalTransaction>,
    branches: DashMap<i64, BranchTransaction>,
    /// xid -> branch ids, in registration order.
    branch_index: DashMap<String, Vec<BranchId>>,
    /// Terminal instant per xid, for grace-window purging.
    finished_at: DashMap<String, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> StoreRef {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn insert_global(&self, tx: GlobalTransaction) -> TxResult<()> {
        self.globals.insert(tx.xid.clone(), tx);
        Ok(())
    }

    async fn global(&self, xid: &str) -> TxResult<Option<GlobalTransaction>> {
        Ok(self.globals.get(xid).map(|entry| entry.clone()))
    }

    async fn update_global_status(&self, xid: &str, next: GlobalStatus) -> TxResult<()> {
        let mut entry = self
            .globals
            .get_mut(xid)
            .ok_or_else(|| TxError::new(ErrorKind::GlobalNotFound, xid.to_string()))?;
        if entry.status == next {
            return Ok(());
        }
        if !entry.status.can_transition_to(next) {
            return Err(TxError::new(
                ErrorKind::Internal,
                format!("illegal global transition {} -> {} for {}", entry.status, next, xid),
            ));
        }
        debug!(xid, from = %entry.status, to = %next, "global status transition");
        entry.status = next;
        drop(entry);
        if next.is_terminal() {
            self.finished_at.insert(xid.to_string(), now_ms());
        }
        Ok(())
    }

    async fn remove_global(&self, xid: &str) -> TxResult<()> {
        self.globals.remove(xid);
        self.finished_at.remove(xid);
        if let Some((_, branch_ids)) = self.branch_index.remove(xid) {
            for branch_id in branch_ids {
                self.branches.remove(&branch_id.as_i64());
            }
        }
        Ok(())
    }

    async fn insert_branch(&self, branch: BranchTransaction) -> TxResult<()> {
        let mut ids = self.branch_index.entry(branch.xid.clone()).or_default();
        if !ids.contains(&branch.branch_id) {
            ids.push(branch.branch_id);
        }
        drop(ids);
        self.branches.insert(branch.branch_id.as_i64(), branch);
        Ok(())
    }

    async fn branch(&self, branch_id: BranchId) -> TxResult<Option<BranchTransaction>> {
        Ok(self.branches.get(&branch_id.as_i64()).map(|entry| entry.clone()))
    }

    async fn branches_of(&self, xid: &str) -> TxResult<Vec<BranchTransaction>> {
        let ids = match self.branch_index.get(xid) {
            Some(ids) => ids.clone(),
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.branches.get(&id.as_i64()).map(|entry| entry.clone()))
            .collect())
    }

    async fn update_branch_status(
        &self,
        branch_id: BranchId,
        next: BranchStatus,
    ) -> TxResult<bool> {
        let mut entry = self
            .branches
            .get_mut(&branch_id.as_i64())
            .ok_or_else(|| TxError::new(ErrorKind::BranchNotFound, branch_id.to_string()))?;
        if entry.status == next || !entry.status.can_transition_to(next) {
            return Ok(false); // repeated or backward report, discarded
        }
        debug!(branch = %branch_id, from = %entry.status, to = %next, "branch status transition");
        entry.status = next;
        if next.is_terminal() {
            entry.end_time_ms = Some(now_ms());
        }
        Ok(true)
    }

    async fn expired_globals(&self, now: u64) -> TxResult<Vec<GlobalTransaction>> {
        Ok(self
            .globals
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn expired_branches(&self, now: u64) -> TxResult<Vec<BranchTransaction>> {
        Ok(self
            .branches
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn failed_branches(&self) -> TxResult<Vec<BranchTransaction>> {
        Ok(self
            .branches
            .iter()
            .filter(|entry| {
                matches!(
                    entry.status,
                    BranchStatus::PhaseTwoCommitFailed | BranchStatus::PhaseTwoRollbackFailed
                )
            })
            .map(|entry| entry.clone())
            .collect())
    }

    async fn purge_finished(&self, grace_ms: u64) -> TxResult<usize> {
        let cutoff = now_ms().saturating_sub(grace_ms);
        let expired: Vec<String> = self
            .finished_at
            .iter()
            .filter(|entry| *entry.value() <= cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        let purged = expired.len();
        for xid in expired {
            self.remove_global(&xid).await?;
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::BranchType;

    fn global(xid: &str) -> GlobalTransaction {
        GlobalTransaction::builder()
            .xid(xid.to_string())
            .status(GlobalStatus::Begin)
            .application_id("svc".to_string())
            .transaction_name("order-pay".to_string())
            .timeout_ms(60_000)
            .build()
    }

    fn branch(id: i64, xid: &str) -> BranchTransaction {
        BranchTransaction::builder()
            .branch_id(BranchId::new(id))
            .xid(xid.to_string())
            .resource_id("rm-a".to_string())
            .branch_type(BranchType::AT)
            .timeout_ms(30_000)
            .build()
    }

    #[tokio::test]
    async fn global_round_trip_and_transition_guard() {
        let store = MemoryStore::new();
        store.insert_global(global("svc:1:1")).await.unwrap();

        store
            .update_global_status("svc:1:1", GlobalStatus::Committing)
            .await
            .unwrap();
        // committed transactions reject a rollback transition
        let err = store
            .update_global_status("svc:1:1", GlobalStatus::Rollbacking)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        store
            .update_global_status("svc:1:1", GlobalStatus::Committed)
            .await
            .unwrap();
        let tx = store.global("svc:1:1").await.unwrap().unwrap();
        assert!(tx.is_terminal());
    }

    #[tokio::test]
    async fn branch_reports_are_forward_only() {
        let store = MemoryStore::new();
        store.insert_global(global("svc:1:1")).await.unwrap();
        store.insert_branch(branch(1001, "svc:1:1")).await.unwrap();

        assert!(store
            .update_branch_status(BranchId::new(1001), BranchStatus::PhaseOneDone)
            .await
            .unwrap());
        // repeated report is discarded
        assert!(!store
            .update_branch_status(BranchId::new(1001), BranchStatus::PhaseOneDone)
            .await
            .unwrap());
        // backward report is discarded
        assert!(!store
            .update_branch_status(BranchId::new(1001), BranchStatus::Registered)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn branches_list_in_registration_order() {
        let store = MemoryStore::new();
        store.insert_global(global("svc:1:1")).await.unwrap();
        store.insert_branch(branch(1001, "svc:1:1")).await.unwrap();
        store.insert_branch(branch(1002, "svc:1:1")).await.unwrap();

        let branches = store.branches_of("svc:1:1").await.unwrap();
        let ids: Vec<i64> = branches.iter().map(|b| b.branch_id.as_i64()).collect();
        assert_eq!(ids, vec![1001, 1002]);
    }

    #[tokio::test]
    async fn purge_drops_terminal_records_after_grace() {
        let store = MemoryStore::new();
        store.insert_global(global("svc:1:1")).await.unwrap();
        store.insert_branch(branch(1001, "svc:1:1")).await.unwrap();
        store
            .update_global_status("svc:1:1", GlobalStatus::Rollbacking)
            .await
            .unwrap();
        store
            .update_global_status("svc:1:1", GlobalStatus::Rollbacked)
            .await
            .unwrap();

        // grace of zero purges immediately
        let purged = store.purge_finished(0).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.global("svc:1:1").await.unwrap().is_none());
        assert!(store.branch(BranchId::new(1001)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_scans_respect_terminality() {
        let store = MemoryStore::new();
        let mut tx = global("svc:1:1");
        tx.begin_time_ms = 0;
        tx.timeout_ms = 1_000;
        store.insert_global(tx).await.unwrap();

        let expired = store.expired_globals(5_000).await.unwrap();
        assert_eq!(expired.len(), 1);

        store
            .update_global_status("svc:1:1", GlobalStatus::TimeoutRollbacking)
            .await
            .unwrap();
        store
            .update_global_status("svc:1:1", GlobalStatus::TimeoutRollbacked)
            .await
            .unwrap();
        assert!(store.expired_globals(5_000).await.unwrap().is_empty());
    }
}
