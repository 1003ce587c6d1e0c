//! TCC resources: registered confirm/cancel services with idempotency and
//! anti-suspension markers. Reflection-style discovery is replaced by
//! explicit registration plus naming-convention lookup against a service
//! container the application provides.

use crate::dispatch::{CommunicationResult, CommunicationStatus, ResourceHandler};
use async_trait::async_trait;
use common::{BranchId, BranchType, ErrorKind, TxError, TxResult};
use dashmap::DashMap;
use getset::Getters;
use std::sync::Arc;
use store::BranchTransaction;
use tracing::{debug, info, instrument, warn};
use typed_builder::TypedBuilder;

/// What a confirm/cancel callback learns about the branch it is finishing.
#[derive(Debug, Clone, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct TccInvocation {
    pub xid: String,
    pub branch_id: BranchId,
    #[builder(default)]
    pub application_data: Option<String>,
}

impl TccInvocation {
    pub fn for_branch(branch: &BranchTransaction) -> Self {
        TccInvocation::builder()
            .xid(branch.xid.clone())
            .branch_id(branch.branch_id)
            .application_data(branch.application_data.clone())
            .build()
    }
}

/// A TCC participant. `confirm`/`cancel` return whether the business action
/// succeeded; transport-level problems go through the error channel.
#[async_trait]
pub trait TccService: Send + Sync {
    fn resource_id(&self) -> &str;

    async fn confirm(&self, invocation: &TccInvocation) -> TxResult<bool>;

    async fn cancel(&self, invocation: &TccInvocation) -> TxResult<bool>;
}

/// Per-resource tuning carried over from the service annotation.
#[derive(Debug, Clone, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct TccResourceOptions {
    #[builder(default = 30_000)]
    pub timeout_ms: u64,
    #[builder(default = 5)]
    pub max_retries: u32,
    #[builder(default = true)]
    pub enabled: bool,
}

impl Default for TccResourceOptions {
    fn default() -> Self {
        TccResourceOptions::builder().build()
    }
}

/// The application's service container, as far as TCC discovery is
/// concerned.
pub trait ServiceContainer: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Arc<dyn TccService>>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Markers {
    tried: bool,
    confirmed: bool,
    cancelled: bool,
    /// Cancel arrived before Try; a later Try must be rejected.
    cancel_without_try: bool,
}

/// Registry of TCC services plus the per-(xid, branch) execution markers
/// that make confirm/cancel idempotent and suspension-safe.
#[derive(Default)]
pub struct TccRegistry {
    services: DashMap<String, (Arc<dyn TccService>, TccResourceOptions)>,
    markers: DashMap<(String, i64), Markers>,
}

impl TccRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Arc<dyn TccService>, options: TccResourceOptions) {
        info!(resource = service.resource_id(), "TCC service registered");
        self.services
            .insert(service.resource_id().to_string(), (service, options));
    }

    /// Naming-convention fallback for services never registered explicitly:
    /// `<id>`, `<id>-service`, `<id>-service-impl` looked up in the
    /// application container, first hit wins and is cached.
    pub fn discover(
        &self,
        container: &dyn ServiceContainer,
        resource_id: &str,
    ) -> Option<Arc<dyn TccService>> {
        if let Some(entry) = self.services.get(resource_id) {
            return Some(entry.0.clone());
        }
        let candidates = [
            resource_id.to_string(),
            format!("{}-service", resource_id),
            format!("{}-service-impl", resource_id),
        ];
        for candidate in &candidates {
            if let Some(service) = container.lookup(candidate) {
                debug!(resource = resource_id, name = %candidate, "TCC service discovered");
                self.register(service.clone(), TccResourceOptions::default());
                return Some(service);
            }
        }
        None
    }

    pub fn resolve(&self, resource_id: &str) -> TxResult<Arc<dyn TccService>> {
        let entry = self.services.get(resource_id).ok_or_else(|| {
            TxError::new(ErrorKind::ResourceNotFound, format!("TCC service {}", resource_id))
        })?;
        let (service, options) = entry.value();
        if !options.enabled {
            return Err(TxError::new(
                ErrorKind::ResourceNotFound,
                format!("TCC service {} is disabled", resource_id),
            ));
        }
        Ok(service.clone())
    }

    fn marker_key(xid: &str, branch_id: BranchId) -> (String, i64) {
        (xid.to_string(), branch_id.as_i64())
    }

    /// Records a Try. Rejected when a cancel-without-try marker exists
    /// (anti-hanging): the branch was already cancelled and this Try arrived
    /// late.
    pub fn mark_tried(&self, xid: &str, branch_id: BranchId) -> TxResult<()> {
        let mut markers = self
            .markers
            .entry(Self::marker_key(xid, branch_id))
            .or_default();
        if markers.cancel_without_try {
            warn!(xid, %branch_id, "late Try after cancel, rejected");
            return Err(TxError::new(
                ErrorKind::GlobalNotActive,
                format!("branch {} of {} already cancelled before Try", branch_id, xid),
            ));
        }
        markers.tried = true;
        Ok(())
    }

    /// Confirm with idempotency: a second confirm is a no-op success.
    pub async fn confirm(&self, branch: &BranchTransaction) -> TxResult<bool> {
        let key = Self::marker_key(&branch.xid, branch.branch_id);
        if self.markers.get(&key).map_or(false, |m| m.confirmed) {
            debug!(xid = %branch.xid, branch = %branch.branch_id, "already confirmed, no-op");
            return Ok(true);
        }
        let service = self.resolve(&branch.resource_id)?;
        let invocation = TccInvocation::for_branch(branch);
        let outcome = service.confirm(&invocation).await?;
        if outcome {
            self.markers.entry(key).or_default().confirmed = true;
        }
        Ok(outcome)
    }

    /// Cancel with idempotency and suspension handling: a second cancel is a
    /// no-op; a cancel with no prior Try records `cancel_without_try` and
    /// succeeds without touching the service.
    pub async fn cancel(&self, branch: &BranchTransaction) -> TxResult<bool> {
        let key = Self::marker_key(&branch.xid, branch.branch_id);
        {
            let mut markers = self.markers.entry(key.clone()).or_default();
            if markers.cancelled {
                debug!(xid = %branch.xid, branch = %branch.branch_id, "already cancelled, no-op");
                return Ok(true);
            }
            if !markers.tried {
                info!(
                    xid = %branch.xid,
                    branch = %branch.branch_id,
                    "cancel before Try, recording marker"
                );
                markers.cancel_without_try = true;
                markers.cancelled = true;
                return Ok(true);
            }
        }
        let service = self.resolve(&branch.resource_id)?;
        let invocation = TccInvocation::for_branch(branch);
        let outcome = service.cancel(&invocation).await?;
        if outcome {
            self.markers.entry(key).or_default().cancelled = true;
        }
        Ok(outcome)
    }
}

/// The phase-2 handler over the registry.
pub struct TccResourceHandler {
    registry: Arc<TccRegistry>,
}

impl TccResourceHandler {
    pub fn new(registry: Arc<TccRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TccRegistry> {
        &self.registry
    }
}

#[async_trait]
impl ResourceHandler for TccResourceHandler {
    fn branch_type(&self) -> BranchType {
        BranchType::TCC
    }

    #[instrument(skip(self, branch), fields(branch = %branch.branch_id))]
    async fn commit(&self, branch: &BranchTransaction) -> CommunicationResult {
        match self.registry.confirm(branch).await {
            Ok(true) => CommunicationResult::success(),
            Ok(false) => CommunicationResult::failed(
                CommunicationStatus::Failure,
                format!("confirm returned false for {}", branch.resource_id),
            ),
            Err(err) => CommunicationResult::from_error(&err),
        }
    }

    #[instrument(skip(self, branch), fields(branch = %branch.branch_id))]
    async fn rollback(&self, branch: &BranchTransaction) -> CommunicationResult {
        match self.registry.cancel(branch).await {
            Ok(true) => CommunicationResult::success(),
            Ok(false) => CommunicationResult::failed(
                CommunicationStatus::Failure,
                format!("cancel returned false for {}", branch.resource_id),
            ),
            Err(err) => CommunicationResult::from_error(&err),
        }
    }
}
