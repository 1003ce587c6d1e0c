use async_trait::async_trait;
use common::config::RetryConfig;
use common::util::backoff::Backoff;
use common::{BranchType, ErrorKind, TxError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use store::BranchTransaction;
use tracing::{debug, instrument, warn};

/// Outcome class of one phase-2 attempt against a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommunicationStatus {
    Success,
    Failure,
    Timeout,
    NetworkError,
    ProtocolError,
    AuthError,
    ResourceError,
    RetryableError,
    NonRetryableError,
    Unknown,
}

impl CommunicationStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CommunicationStatus::Success)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CommunicationStatus::Timeout
                | CommunicationStatus::NetworkError
                | CommunicationStatus::ResourceError
                | CommunicationStatus::RetryableError
                | CommunicationStatus::Unknown
        )
    }
}

impl fmt::Display for CommunicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<ErrorKind> for CommunicationStatus {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Network => CommunicationStatus::NetworkError,
            ErrorKind::Timeout => CommunicationStatus::Timeout,
            ErrorKind::Wire | ErrorKind::Protocol => CommunicationStatus::ProtocolError,
            ErrorKind::Auth => CommunicationStatus::AuthError,
            ErrorKind::ResourceNotFound | ErrorKind::ServiceNotResolvable => {
                CommunicationStatus::ResourceError
            }
            ErrorKind::DirtyWrite | ErrorKind::NoUndoLog | ErrorKind::UnsupportedSql => {
                CommunicationStatus::NonRetryableError
            }
            ErrorKind::LockConflict => CommunicationStatus::RetryableError,
            _ => CommunicationStatus::NonRetryableError,
        }
    }
}

/// Result of one attempt: a status class plus whatever detail the handler
/// had.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationResult {
    pub status: CommunicationStatus,
    pub error: Option<String>,
}

impl CommunicationResult {
    pub fn success() -> Self {
        Self {
            status: CommunicationStatus::Success,
            error: None,
        }
    }

    pub fn failed(status: CommunicationStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
        }
    }

    pub fn from_error(err: &TxError) -> Self {
        Self {
            status: err.kind().into(),
            error: Some(err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// The phase-2 direction the dispatcher is driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTwoOp {
    Commit,
    Rollback,
}

impl fmt::Display for PhaseTwoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseTwoOp::Commit => write!(f, "commit"),
            PhaseTwoOp::Rollback => write!(f, "rollback"),
        }
    }
}

/// One resource family's phase-2 driver.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    fn branch_type(&self) -> BranchType;

    async fn commit(&self, branch: &BranchTransaction) -> CommunicationResult;

    async fn rollback(&self, branch: &BranchTransaction) -> CommunicationResult;
}

pub type DispatcherRef = Arc<BranchDispatcher>;

/// Routes a branch to the handler for its type and wraps every dispatch in
/// the retry policy: exponential backoff with jitter, per-family attempt
/// ceilings, non-retryable outcomes aborting after the first attempt.
pub struct BranchDispatcher {
    handlers: DashMap<BranchType, Arc<dyn ResourceHandler>>,
    retry: RetryConfig,
}

impl BranchDispatcher {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            handlers: DashMap::new(),
            retry,
        }
    }

    pub fn shared(retry: RetryConfig) -> DispatcherRef {
        Arc::new(Self::new(retry))
    }

    pub fn register_handler(&self, handler: Arc<dyn ResourceHandler>) {
        self.handlers.insert(handler.branch_type(), handler);
    }

    pub fn max_attempts(&self, branch_type: BranchType) -> u32 {
        let attempts = self.retry.max_attempts();
        match branch_type {
            BranchType::AT => *attempts.at(),
            BranchType::TCC => *attempts.tcc(),
            BranchType::HTTP => *attempts.http(),
            BranchType::MQ => *attempts.mq(),
            BranchType::XA => *attempts.xa(),
        }
    }

    #[instrument(skip(self, branch), fields(branch = %branch.branch_id, kind = %branch.branch_type, op = %op))]
    pub async fn dispatch(
        &self,
        op: PhaseTwoOp,
        branch: &BranchTransaction,
    ) -> CommunicationResult {
        let handler = match self.handlers.get(&branch.branch_type) {
            Some(handler) => handler.clone(),
            None => {
                warn!("no handler registered for {}", branch.branch_type);
                return CommunicationResult::failed(
                    CommunicationStatus::NonRetryableError,
                    format!("no handler for branch type {}", branch.branch_type),
                );
            }
        };

        let ceiling = self.max_attempts(branch.branch_type).max(1);
        let mut backoff = Backoff::new(
            Duration::from_millis(*self.retry.initial_interval_ms()),
            *self.retry.multiplier(),
            Duration::from_millis(*self.retry.max_interval_ms()),
        )
        .with_jitter();

        let mut attempt = 1_u32;
        loop {
            let result = match op {
                PhaseTwoOp::Commit => handler.commit(branch).await,
                PhaseTwoOp::Rollback => handler.rollback(branch).await,
            };

            if result.is_success() {
                debug!(attempt, "phase-2 {} succeeded", op);
                return result;
            }
            if !result.status.is_retryable() {
                warn!(attempt, status = %result.status, "phase-2 {} failed, not retryable", op);
                return result;
            }
            if attempt >= ceiling {
                warn!(attempt, status = %result.status, "phase-2 {} attempts exhausted", op);
                return result;
            }

            let delay = backoff.next_delay();
            debug!(attempt, status = %result.status, ?delay, "phase-2 {} retrying", op);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
