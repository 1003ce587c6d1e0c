use async_trait::async_trait;
use common::util::time::now_ms;
use common::{
    BranchId, BranchIdAllocator, BranchStatus, BranchType, ErrorKind, GlobalStatus, TxConfig,
    TxError, TxResult, XidGenerator,
};
use dashmap::DashMap;
use datasource::{BranchRegistrar, BranchRegistration};
use resource::dispatch::DispatcherRef;
use resource::{CommunicationResult, PhaseTwoOp};
use std::sync::Arc;
use store::lock::LockManagerRef;
use store::store::StoreRef;
use store::{BranchTransaction, GlobalTransaction, RowKey, TransactionStore};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

pub type CoordinatorRef = Arc<Coordinator>;

/// The transaction coordinator. All mutation of a given xid goes through
/// its keyed mutex; operations on distinct xids run in parallel.
pub struct Coordinator {
    config: TxConfig,
    store: StoreRef,
    locks: LockManagerRef,
    dispatcher: DispatcherRef,
    xids: XidGenerator,
    branch_ids: BranchIdAllocator,
    xid_mutexes: DashMap<String, Arc<Mutex<()>>>,
}

impl Coordinator {
    pub fn new(
        config: TxConfig,
        store: StoreRef,
        locks: LockManagerRef,
        dispatcher: DispatcherRef,
    ) -> Self {
        Self {
            config,
            store,
            locks,
            dispatcher,
            xids: XidGenerator::new(),
            branch_ids: BranchIdAllocator::new(),
            xid_mutexes: DashMap::new(),
        }
    }

    pub fn shared(
        config: TxConfig,
        store: StoreRef,
        locks: LockManagerRef,
        dispatcher: DispatcherRef,
    ) -> CoordinatorRef {
        Arc::new(Self::new(config, store, locks, dispatcher))
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    pub fn store(&self) -> &StoreRef {
        &self.store
    }

    pub fn locks(&self) -> &LockManagerRef {
        &self.locks
    }

    fn xid_mutex(&self, xid: &str) -> Arc<Mutex<()>> {
        self.xid_mutexes
            .entry(xid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Opens a global transaction. The caller's timeout is authoritative,
    /// clamped into the configured bounds; zero means the default.
    #[instrument(skip(self))]
    pub async fn begin(
        &self,
        application_id: &str,
        transaction_name: &str,
        timeout_ms: u64,
    ) -> TxResult<String> {
        let timeout_ms = self.config.clamp_global_timeout(timeout_ms);
        let xid = self.xids.next_xid(application_id);
        let tx = GlobalTransaction::builder()
            .xid(xid.clone())
            .status(GlobalStatus::Begin)
            .application_id(application_id.to_string())
            .transaction_name(transaction_name.to_string())
            .timeout_ms(timeout_ms)
            .build();
        self.store.insert_global(tx).await?;
        info!(%xid, transaction_name, timeout_ms, "global transaction opened");
        Ok(xid)
    }

    /// Enlists a branch. AT branches acquire their global locks (bounded
    /// retry) before the branch row exists; a conflict surfaces as
    /// `LockConflict` and nothing is recorded.
    #[instrument(skip(self, lock_key, application_data))]
    pub async fn register_branch(
        &self,
        xid: &str,
        resource_id: &str,
        branch_type: BranchType,
        lock_key: Option<String>,
        application_data: Option<String>,
    ) -> TxResult<BranchId> {
        let mutex = self.xid_mutex(xid);
        let _guard = mutex.lock().await;

        let global = self
            .store
            .global(xid)
            .await?
            .ok_or_else(|| TxError::new(ErrorKind::GlobalNotFound, xid.to_string()))?;
        if !global.status.is_active() {
            return Err(TxError::new(
                ErrorKind::GlobalNotActive,
                format!("{} is {}", xid, global.status),
            ));
        }

        let branch_id = self.branch_ids.next_id();

        if branch_type == BranchType::AT {
            if let Some(lock_key) = lock_key.as_deref() {
                let row_keys = RowKey::parse_lock_key(resource_id, lock_key);
                self.locks
                    .acquire_with_retry(&row_keys, xid, branch_id, self.config.lock())
                    .await?;
            }
        }

        let branch = BranchTransaction::builder()
            .branch_id(branch_id)
            .xid(xid.to_string())
            .resource_id(resource_id.to_string())
            .branch_type(branch_type)
            .lock_key(lock_key)
            .application_data(application_data)
            .timeout_ms(self.config.clamp_branch_timeout(0))
            .build();
        self.store.insert_branch(branch).await?;
        debug!(xid, %branch_id, %branch_type, "branch registered");
        Ok(branch_id)
    }

    /// Phase-1 outcome report. Only the two phase-1 outcomes are accepted
    /// from resource managers; every other transition belongs to the
    /// coordinator. Repeated or backward reports are discarded.
    #[instrument(skip(self))]
    pub async fn report_branch(
        &self,
        xid: &str,
        branch_id: BranchId,
        status: BranchStatus,
    ) -> TxResult<()> {
        if !matches!(
            status,
            BranchStatus::PhaseOneDone | BranchStatus::PhaseOneFailed
        ) {
            return Err(TxError::new(
                ErrorKind::Protocol,
                format!("resource managers may only report phase-1 outcomes, got {}", status),
            ));
        }
        let mutex = self.xid_mutex(xid);
        let _guard = mutex.lock().await;

        let branch = self
            .store
            .branch(branch_id)
            .await?
            .ok_or_else(|| TxError::new(ErrorKind::BranchNotFound, branch_id.to_string()))?;
        if branch.xid != xid {
            return Err(TxError::new(
                ErrorKind::BranchNotFound,
                format!("branch {} does not belong to {}", branch_id, xid),
            ));
        }
        let applied = self.store.update_branch_status(branch_id, status).await?;
        if !applied {
            debug!(xid, %branch_id, %status, "stale branch report discarded");
        }
        Ok(())
    }

    pub async fn global_status(&self, xid: &str) -> TxResult<GlobalStatus> {
        Ok(self
            .store
            .global(xid)
            .await?
            .map(|tx| tx.status)
            // terminal records past their grace window are purged; an
            // unknown xid therefore reads as finished
            .unwrap_or(GlobalStatus::Finished))
    }

    /// Drives phase-2 commit. Idempotent on the commit path; a transaction
    /// already on the rollback path rejects the commit with
    /// `GlobalNotActive`.
    #[instrument(skip(self))]
    pub async fn global_commit(&self, xid: &str) -> TxResult<GlobalStatus> {
        let mutex = self.xid_mutex(xid);
        let _guard = mutex.lock().await;

        let global = self
            .store
            .global(xid)
            .await?
            .ok_or_else(|| TxError::new(ErrorKind::GlobalNotFound, xid.to_string()))?;
        match global.status {
            GlobalStatus::Committed | GlobalStatus::CommitFailed => Ok(global.status),
            GlobalStatus::Begin | GlobalStatus::Committing => {
                self.drive_phase_two(xid, PhaseTwoOp::Commit, false).await
            }
            status => Err(TxError::new(
                ErrorKind::GlobalNotActive,
                format!("{} is {}", xid, status),
            )),
        }
    }

    /// Drives phase-2 rollback. Idempotent on the rollback path; a
    /// transaction already committed (or committing) rejects it.
    #[instrument(skip(self))]
    pub async fn global_rollback(&self, xid: &str) -> TxResult<GlobalStatus> {
        let mutex = self.xid_mutex(xid);
        let _guard = mutex.lock().await;

        let global = self
            .store
            .global(xid)
            .await?
            .ok_or_else(|| TxError::new(ErrorKind::GlobalNotFound, xid.to_string()))?;
        match global.status {
            GlobalStatus::Rollbacked
            | GlobalStatus::RollbackFailed
            | GlobalStatus::TimeoutRollbacked => Ok(global.status),
            GlobalStatus::Begin | GlobalStatus::Rollbacking => {
                self.drive_phase_two(xid, PhaseTwoOp::Rollback, false).await
            }
            GlobalStatus::TimeoutRollbacking => {
                self.drive_phase_two(xid, PhaseTwoOp::Rollback, true).await
            }
            status => Err(TxError::new(
                ErrorKind::GlobalNotActive,
                format!("{} is {}", xid, status),
            )),
        }
    }

    /// Timeout path, entered by the scanner. Re-checks expiry under the xid
    /// mutex so a racing commit wins cleanly.
    #[instrument(skip(self))]
    pub async fn timeout_rollback(&self, xid: &str) -> TxResult<GlobalStatus> {
        let mutex = self.xid_mutex(xid);
        let _guard = mutex.lock().await;

        let global = match self.store.global(xid).await? {
            Some(global) => global,
            None => return Ok(GlobalStatus::Finished),
        };
        if global.status != GlobalStatus::Begin || !global.is_expired(now_ms()) {
            return Ok(global.status);
        }
        warn!(xid, timeout_ms = global.timeout_ms, "global transaction timed out");
        self.drive_phase_two(xid, PhaseTwoOp::Rollback, true).await
    }

    /// The phase-2 driver. Caller holds the xid mutex. Eligible branches
    /// are dispatched in parallel; every branch outcome is persisted before
    /// the global status flips, and AT locks release strictly after that.
    async fn drive_phase_two(
        &self,
        xid: &str,
        op: PhaseTwoOp,
        timeout_driven: bool,
    ) -> TxResult<GlobalStatus> {
        let driving_status = match (op, timeout_driven) {
            (PhaseTwoOp::Commit, _) => GlobalStatus::Committing,
            (PhaseTwoOp::Rollback, false) => GlobalStatus::Rollbacking,
            (PhaseTwoOp::Rollback, true) => GlobalStatus::TimeoutRollbacking,
        };
        self.store.update_global_status(xid, driving_status).await?;

        let branches = self.store.branches_of(xid).await?;
        let mut join_set: JoinSet<(BranchId, bool)> = JoinSet::new();
        let mut all_ok = true;

        for branch in branches {
            if branch.status.is_terminal() {
                continue;
            }
            // a branch that timed out has nothing safe to commit; it stays
            // in Timeout for the rollback path and fails this commit
            if op == PhaseTwoOp::Commit && branch.status == BranchStatus::Timeout {
                warn!(xid, branch = %branch.branch_id, "timed-out branch fails the commit");
                all_ok = false;
                continue;
            }
            if !branch.status.phase_two_eligible() {
                continue;
            }

            let driving = match op {
                PhaseTwoOp::Commit => BranchStatus::PhaseTwoCommitting,
                PhaseTwoOp::Rollback => BranchStatus::PhaseTwoRollbacking,
            };
            self.store.update_branch_status(branch.branch_id, driving).await?;

            let store = self.store.clone();
            let dispatcher = self.dispatcher.clone();
            join_set.spawn(async move {
                // the dispatched record still carries the phase-1 status so
                // handlers can tell a never-completed branch apart
                let result: CommunicationResult = dispatcher.dispatch(op, &branch).await;
                let final_status = match (op, result.is_success()) {
                    (PhaseTwoOp::Commit, true) => BranchStatus::PhaseTwoCommitted,
                    (PhaseTwoOp::Commit, false) => BranchStatus::PhaseTwoCommitFailed,
                    (PhaseTwoOp::Rollback, true) => BranchStatus::PhaseTwoRollbacked,
                    (PhaseTwoOp::Rollback, false) => BranchStatus::PhaseTwoRollbackFailed,
                };
                if let Err(err) = store.update_branch_status(branch.branch_id, final_status).await {
                    error!(branch = %branch.branch_id, error = %err, "failed to persist branch outcome");
                    return (branch.branch_id, false);
                }
                if !result.is_success() {
                    warn!(
                        branch = %branch.branch_id,
                        status = %result.status,
                        error = result.error.as_deref().unwrap_or(""),
                        "branch phase-2 failed, flagged for operator attention"
                    );
                }
                (branch.branch_id, result.is_success())
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, ok)) => all_ok &= ok,
                Err(err) => {
                    error!(xid, error = %err, "branch dispatch task failed");
                    all_ok = false;
                }
            }
        }

        let final_status = match (op, timeout_driven, all_ok) {
            (PhaseTwoOp::Commit, _, true) => GlobalStatus::Committed,
            (PhaseTwoOp::Commit, _, false) => GlobalStatus::CommitFailed,
            (PhaseTwoOp::Rollback, false, true) => GlobalStatus::Rollbacked,
            (PhaseTwoOp::Rollback, true, true) => GlobalStatus::TimeoutRollbacked,
            (PhaseTwoOp::Rollback, _, false) => GlobalStatus::RollbackFailed,
        };
        self.store.update_global_status(xid, final_status).await?;

        // lock release happens-after every branch outcome is durable
        let released = self.locks.release_xid(xid);
        info!(xid, %final_status, released, "global transaction terminated");
        Ok(final_status)
    }
}

/// In-process enlistment for deployments (and tests) where the interceptor
/// talks straight to the coordinator instead of crossing the wire.
#[async_trait]
impl BranchRegistrar for Coordinator {
    async fn register_branch(&self, registration: BranchRegistration) -> TxResult<BranchId> {
        Coordinator::register_branch(
            self,
            &registration.xid,
            &registration.resource_id,
            registration.branch_type,
            registration.lock_key,
            registration.application_data,
        )
        .await
    }

    async fn report_branch(
        &self,
        xid: &str,
        branch_id: BranchId,
        status: BranchStatus,
    ) -> TxResult<()> {
        Coordinator::report_branch(self, xid, branch_id, status).await
    }
}
