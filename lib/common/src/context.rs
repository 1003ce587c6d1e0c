//! The execution context of an in-flight global transaction. An explicit
//! value threaded through the interceptor, resource calls and client rather
//! than process-wide mutable state; `wrap` captures it for work handed to
//! another task.

use crate::ids::BranchId;
use getset::{Getters, Setters};
use serde::{Deserialize, Serialize};
use std::future::Future;
use typed_builder::TypedBuilder;

pub const DEFAULT_RESOURCE_GROUP: &str = "default";

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, Setters, TypedBuilder,
)]
#[getset(get = "pub", set = "pub")]
pub struct TxContext {
    /// Active global transaction id, if any. Interception only engages when
    /// this is bound.
    #[builder(default)]
    xid: Option<String>,
    /// Branch the current resource call belongs to.
    #[builder(default)]
    branch_id: Option<BranchId>,
    #[builder(default = DEFAULT_RESOURCE_GROUP.to_string())]
    resource_group_id: String,
    #[builder(default)]
    transaction_name: Option<String>,
    /// Deadline budget of the surrounding call, carried across tasks.
    #[builder(default = 60_000)]
    timeout_ms: u64,
}

impl Default for TxContext {
    fn default() -> Self {
        TxContext::builder().build()
    }
}

impl TxContext {
    /// A context with no bound transaction; the interceptor passes SQL
    /// straight through under it.
    pub fn unbound() -> Self {
        Self::default()
    }

    pub fn in_transaction(&self) -> bool {
        self.xid.is_some()
    }

    pub fn bind(&mut self, xid: impl Into<String>) {
        self.xid = Some(xid.into());
    }

    /// Unbinds the transaction on scope exit; branch binding goes with it.
    pub fn unbind(&mut self) -> Option<String> {
        self.branch_id = None;
        self.xid.take()
    }

    /// Captures the current context and rebinds it around `f` on whatever
    /// task ends up running the future. This is the cross-thread propagation
    /// seam: spawn the returned future, not the bare one.
    pub fn wrap<F, T>(&self, f: impl FnOnce(TxContext) -> F) -> impl Future<Output = T>
    where
        F: Future<Output = T>,
    {
        let captured = self.clone();
        f(captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_unbind_round_trip() {
        let mut ctx = TxContext::unbound();
        assert!(!ctx.in_transaction());
        ctx.bind("svc:1700000000000:1");
        assert!(ctx.in_transaction());
        let taken = ctx.unbind();
        assert_eq!(taken.as_deref(), Some("svc:1700000000000:1"));
        assert!(!ctx.in_transaction());
        assert!(ctx.branch_id().is_none());
    }

    #[tokio::test]
    async fn wrap_carries_the_context_into_a_spawned_task() {
        let mut ctx = TxContext::unbound();
        ctx.bind("svc:1:1");
        let fut = ctx.wrap(|captured| async move { captured.xid().clone() });
        let xid = tokio::spawn(fut).await.unwrap();
        assert_eq!(xid.as_deref(), Some("svc:1:1"));
    }
}
