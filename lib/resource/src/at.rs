//! AT-mode phase-2: commit deletes the branch's undo rows, rollback replays
//! them through the compensation pipeline. Business executors register here
//! by resource id.

use crate::dispatch::{CommunicationResult, ResourceHandler};
use async_trait::async_trait;
use common::{BranchStatus, BranchType};
use dashmap::DashMap;
use datasource::{SqlExecutor, UndoLogManager};
use std::sync::Arc;
use store::BranchTransaction;
use tracing::{debug, instrument, warn};

pub struct AtResourceHandler {
    executors: DashMap<String, Arc<dyn SqlExecutor>>,
    undo: Arc<UndoLogManager>,
}

impl AtResourceHandler {
    pub fn new(undo: Arc<UndoLogManager>) -> Self {
        Self {
            executors: DashMap::new(),
            undo,
        }
    }

    pub fn register_resource(&self, resource_id: impl Into<String>, executor: Arc<dyn SqlExecutor>) {
        self.executors.insert(resource_id.into(), executor);
    }

    fn executor_of(&self, resource_id: &str) -> Option<Arc<dyn SqlExecutor>> {
        self.executors.get(resource_id).map(|entry| entry.clone())
    }
}

#[async_trait]
impl ResourceHandler for AtResourceHandler {
    fn branch_type(&self) -> BranchType {
        BranchType::AT
    }

    #[instrument(skip(self, branch), fields(branch = %branch.branch_id))]
    async fn commit(&self, branch: &BranchTransaction) -> CommunicationResult {
        let executor = match self.executor_of(&branch.resource_id) {
            Some(executor) => executor,
            None => {
                warn!("no executor registered for {}", branch.resource_id);
                return CommunicationResult::failed(
                    crate::dispatch::CommunicationStatus::ResourceError,
                    format!("unknown resource {}", branch.resource_id),
                );
            }
        };
        match self
            .undo
            .delete_undo_logs(executor.as_ref(), &branch.xid, branch.branch_id)
            .await
        {
            Ok(deleted) => {
                debug!(deleted, "undo log cleaned up");
                CommunicationResult::success()
            }
            Err(err) => CommunicationResult::from_error(&err),
        }
    }

    #[instrument(skip(self, branch), fields(branch = %branch.branch_id))]
    async fn rollback(&self, branch: &BranchTransaction) -> CommunicationResult {
        let executor = match self.executor_of(&branch.resource_id) {
            Some(executor) => executor,
            None => {
                warn!("no executor registered for {}", branch.resource_id);
                return CommunicationResult::failed(
                    crate::dispatch::CommunicationStatus::ResourceError,
                    format!("unknown resource {}", branch.resource_id),
                );
            }
        };
        // the dispatcher hands us the branch as it was before the phase-2
        // transition, so the status still reflects the phase-1 outcome
        let phase_one_completed = branch.status == BranchStatus::PhaseOneDone;
        match self
            .undo
            .compensate(
                executor.as_ref(),
                &branch.xid,
                branch.branch_id,
                phase_one_completed,
            )
            .await
        {
            Ok(()) => CommunicationResult::success(),
            Err(err) => CommunicationResult::from_error(&err),
        }
    }
}
