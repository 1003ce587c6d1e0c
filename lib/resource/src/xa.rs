//! XA branches: the database driver already prepared the branch in phase-1,
//! so phase-2 is a single `XA COMMIT` / `XA ROLLBACK` on the registered
//! connection.

use crate::dispatch::{CommunicationResult, CommunicationStatus, ResourceHandler};
use async_trait::async_trait;
use common::{BranchId, BranchType, TxResult};
use dashmap::DashMap;
use std::sync::Arc;
use store::BranchTransaction;
use tracing::{instrument, warn};

/// A driver connection that can finish a prepared XA branch.
#[async_trait]
pub trait XaConnection: Send + Sync {
    async fn xa_commit(&self, xid: &str, branch_id: BranchId) -> TxResult<()>;

    async fn xa_rollback(&self, xid: &str, branch_id: BranchId) -> TxResult<()>;
}

pub struct XaResourceHandler {
    connections: DashMap<String, Arc<dyn XaConnection>>,
}

impl XaResourceHandler {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    pub fn register_resource(
        &self,
        resource_id: impl Into<String>,
        connection: Arc<dyn XaConnection>,
    ) {
        self.connections.insert(resource_id.into(), connection);
    }

    fn connection_of(&self, resource_id: &str) -> Option<Arc<dyn XaConnection>> {
        self.connections.get(resource_id).map(|entry| entry.clone())
    }
}

impl Default for XaResourceHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceHandler for XaResourceHandler {
    fn branch_type(&self) -> BranchType {
        BranchType::XA
    }

    #[instrument(skip(self, branch), fields(branch = %branch.branch_id))]
    async fn commit(&self, branch: &BranchTransaction) -> CommunicationResult {
        match self.connection_of(&branch.resource_id) {
            Some(connection) => {
                match connection.xa_commit(&branch.xid, branch.branch_id).await {
                    Ok(()) => CommunicationResult::success(),
                    Err(err) => CommunicationResult::from_error(&err),
                }
            }
            None => {
                warn!("no XA connection for {}", branch.resource_id);
                CommunicationResult::failed(
                    CommunicationStatus::ResourceError,
                    format!("unknown XA resource {}", branch.resource_id),
                )
            }
        }
    }

    #[instrument(skip(self, branch), fields(branch = %branch.branch_id))]
    async fn rollback(&self, branch: &BranchTransaction) -> CommunicationResult {
        match self.connection_of(&branch.resource_id) {
            Some(connection) => {
                match connection.xa_rollback(&branch.xid, branch.branch_id).await {
                    Ok(()) => CommunicationResult::success(),
                    Err(err) => CommunicationResult::from_error(&err),
                }
            }
            None => {
                warn!("no XA connection for {}", branch.resource_id);
                CommunicationResult::failed(
                    CommunicationStatus::ResourceError,
                    format!("unknown XA resource {}", branch.resource_id),
                )
            }
        }
    }
}
