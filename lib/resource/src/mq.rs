//! MQ branches: phase-1 parked a half-message at the broker; commit
//! confirms it for delivery, rollback discards it. The half-message id rides
//! in the branch's application data.

use crate::dispatch::{CommunicationResult, CommunicationStatus, ResourceHandler};
use async_trait::async_trait;
use common::{BranchType, TxResult};
use dashmap::DashMap;
use std::sync::Arc;
use store::BranchTransaction;
use tracing::{instrument, warn};

/// The broker operations transactional messaging needs.
#[async_trait]
pub trait MqBroker: Send + Sync {
    async fn confirm(&self, half_message_id: &str) -> TxResult<()>;

    async fn discard(&self, half_message_id: &str) -> TxResult<()>;
}

pub struct MqResourceHandler {
    brokers: DashMap<String, Arc<dyn MqBroker>>,
}

impl MqResourceHandler {
    pub fn new() -> Self {
        Self {
            brokers: DashMap::new(),
        }
    }

    pub fn register_resource(&self, resource_id: impl Into<String>, broker: Arc<dyn MqBroker>) {
        self.brokers.insert(resource_id.into(), broker);
    }

    fn drive_parts<'a>(
        &self,
        branch: &'a BranchTransaction,
    ) -> Result<(Arc<dyn MqBroker>, &'a str), CommunicationResult> {
        let broker = match self.brokers.get(&branch.resource_id) {
            Some(broker) => broker.clone(),
            None => {
                warn!("no broker registered for {}", branch.resource_id);
                return Err(CommunicationResult::failed(
                    CommunicationStatus::ResourceError,
                    format!("unknown MQ resource {}", branch.resource_id),
                ));
            }
        };
        let half_message_id = match branch.application_data.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(CommunicationResult::failed(
                    CommunicationStatus::NonRetryableError,
                    format!("branch {} carries no half-message id", branch.branch_id),
                ))
            }
        };
        Ok((broker, half_message_id))
    }
}

impl Default for MqResourceHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceHandler for MqResourceHandler {
    fn branch_type(&self) -> BranchType {
        BranchType::MQ
    }

    #[instrument(skip(self, branch), fields(branch = %branch.branch_id))]
    async fn commit(&self, branch: &BranchTransaction) -> CommunicationResult {
        let (broker, half_message_id) = match self.drive_parts(branch) {
            Ok(parts) => parts,
            Err(result) => return result,
        };
        match broker.confirm(half_message_id).await {
            Ok(()) => CommunicationResult::success(),
            Err(err) => CommunicationResult::from_error(&err),
        }
    }

    #[instrument(skip(self, branch), fields(branch = %branch.branch_id))]
    async fn rollback(&self, branch: &BranchTransaction) -> CommunicationResult {
        let (broker, half_message_id) = match self.drive_parts(branch) {
            Ok(parts) => parts,
            Err(result) => return result,
        };
        match broker.discard(half_message_id).await {
            Ok(()) => CommunicationResult::success(),
            Err(err) => CommunicationResult::from_error(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::BranchId;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBroker {
        confirmed: Mutex<Vec<String>>,
        discarded: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MqBroker for FakeBroker {
        async fn confirm(&self, half_message_id: &str) -> TxResult<()> {
            self.confirmed.lock().unwrap().push(half_message_id.to_string());
            Ok(())
        }

        async fn discard(&self, half_message_id: &str) -> TxResult<()> {
            self.discarded.lock().unwrap().push(half_message_id.to_string());
            Ok(())
        }
    }

    fn mq_branch(half_message: Option<&str>) -> BranchTransaction {
        BranchTransaction::builder()
            .branch_id(BranchId::new(3001))
            .xid("svc:1:1".to_string())
            .resource_id("mq-orders".to_string())
            .branch_type(BranchType::MQ)
            .application_data(half_message.map(|s| s.to_string()))
            .timeout_ms(30_000)
            .build()
    }

    #[tokio::test]
    async fn commit_confirms_and_rollback_discards() {
        let handler = MqResourceHandler::new();
        let broker = Arc::new(FakeBroker::default());
        handler.register_resource("mq-orders", broker.clone());

        assert!(handler.commit(&mq_branch(Some("half-42"))).await.is_success());
        assert!(handler.rollback(&mq_branch(Some("half-43"))).await.is_success());
        assert_eq!(*broker.confirmed.lock().unwrap(), vec!["half-42"]);
        assert_eq!(*broker.discarded.lock().unwrap(), vec!["half-43"]);
    }

    #[tokio::test]
    async fn missing_half_message_id_is_non_retryable() {
        let handler = MqResourceHandler::new();
        handler.register_resource("mq-orders", Arc::new(FakeBroker::default()));
        let result = handler.commit(&mq_branch(None)).await;
        assert_eq!(result.status, CommunicationStatus::NonRetryableError);
    }
}
