//! HTTP branches: phase-2 is a POST against the owning service's
//! confirm/cancel endpoint, with the transaction identity in headers and a
//! JSON envelope in the body. Response status codes map onto the
//! communication taxonomy; 5xx and 408/504 retry, auth failures and other
//! 4xx do not.

use crate::dispatch::{CommunicationResult, CommunicationStatus, ResourceHandler};
use crate::resolver::AddressResolver;
use async_trait::async_trait;
use common::util::time::now_ms;
use common::BranchType;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use store::BranchTransaction;
use tracing::{debug, instrument, warn};

pub const HEADER_TRANSACTION_ID: &str = "X-Transaction-ID";
pub const HEADER_BRANCH_ID: &str = "X-Branch-ID";
pub const HEADER_SERVICE_GROUP: &str = "X-Service-Group";
pub const HEADER_API_KEY: &str = "X-API-Key";

pub const DEFAULT_CONFIRM_PATH: &str = "/transaction/confirm";
pub const DEFAULT_CANCEL_PATH: &str = "/transaction/cancel";

/// Credential attached to outgoing confirm/cancel calls.
#[derive(Debug, Clone, Default)]
pub enum HttpAuth {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer(String),
    ApiKey(String),
}

pub struct HttpResourceHandler {
    client: Client,
    resolver: Arc<dyn AddressResolver>,
    confirm_path: String,
    cancel_path: String,
    service_group: String,
    auth: HttpAuth,
}

impl HttpResourceHandler {
    pub fn new(resolver: Arc<dyn AddressResolver>, service_group: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            resolver,
            confirm_path: DEFAULT_CONFIRM_PATH.to_string(),
            cancel_path: DEFAULT_CANCEL_PATH.to_string(),
            service_group: service_group.into(),
            auth: HttpAuth::None,
        }
    }

    pub fn with_paths(mut self, confirm: impl Into<String>, cancel: impl Into<String>) -> Self {
        self.confirm_path = confirm.into();
        self.cancel_path = cancel.into();
        self
    }

    pub fn with_auth(mut self, auth: HttpAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        self
    }

    async fn post_operation(
        &self,
        branch: &BranchTransaction,
        operation: &str,
        path: &str,
    ) -> CommunicationResult {
        let base = match self.resolver.resolve(&branch.resource_id) {
            Ok(url) => url,
            Err(err) => {
                warn!(resource = %branch.resource_id, error = %err, "address resolution failed");
                return CommunicationResult::from_error(&err);
            }
        };
        let url = match base.join(path) {
            Ok(url) => url,
            Err(err) => {
                return CommunicationResult::failed(
                    CommunicationStatus::NonRetryableError,
                    format!("bad endpoint path {}: {}", path, err),
                )
            }
        };

        let body = json!({
            "xid": branch.xid,
            "branch_id": branch.branch_id.as_i64(),
            "operation": operation,
            "timestamp": now_ms(),
            "service_group": self.service_group,
            "parameters": branch.application_data,
        });

        let mut request = self
            .client
            .post(url.clone())
            .header(HEADER_TRANSACTION_ID, branch.xid.as_str())
            .header(HEADER_BRANCH_ID, branch.branch_id.to_string())
            .header(HEADER_SERVICE_GROUP, self.service_group.as_str())
            .json(&body);
        request = match &self.auth {
            HttpAuth::None => request,
            HttpAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            HttpAuth::Bearer(token) => request.bearer_auth(token),
            HttpAuth::ApiKey(key) => request.header(HEADER_API_KEY, key.as_str()),
        };

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let mapped = map_status(status);
                debug!(%url, http = %status, mapped = %mapped, "{} dispatched", operation);
                if mapped.is_success() {
                    CommunicationResult::success()
                } else {
                    CommunicationResult::failed(
                        mapped,
                        format!("{} returned {}", url, status),
                    )
                }
            }
            Err(err) if err.is_timeout() => CommunicationResult::failed(
                CommunicationStatus::Timeout,
                format!("{} timed out: {}", url, err),
            ),
            Err(err) => CommunicationResult::failed(
                CommunicationStatus::NetworkError,
                format!("{} unreachable: {}", url, err),
            ),
        }
    }
}

/// The response-status table of the protocol.
pub fn map_status(status: StatusCode) -> CommunicationStatus {
    match status.as_u16() {
        200..=299 => CommunicationStatus::Success,
        401 | 403 => CommunicationStatus::AuthError,
        404 => CommunicationStatus::ResourceError,
        408 | 504 => CommunicationStatus::Timeout,
        // duplicate submission; the work is already done on the other side
        409 => CommunicationStatus::Failure,
        400..=499 => CommunicationStatus::NonRetryableError,
        500..=599 => CommunicationStatus::RetryableError,
        _ => CommunicationStatus::Unknown,
    }
}

#[async_trait]
impl ResourceHandler for HttpResourceHandler {
    fn branch_type(&self) -> BranchType {
        BranchType::HTTP
    }

    #[instrument(skip(self, branch), fields(branch = %branch.branch_id))]
    async fn commit(&self, branch: &BranchTransaction) -> CommunicationResult {
        self.post_operation(branch, "confirm", &self.confirm_path).await
    }

    #[instrument(skip(self, branch), fields(branch = %branch.branch_id))]
    async fn rollback(&self, branch: &BranchTransaction) -> CommunicationResult {
        self.post_operation(branch, "cancel", &self.cancel_path).await
    }
}
