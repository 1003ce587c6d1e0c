//! Row-shaped records for global transactions and their branches. Mutation
//! goes through the store, which enforces the transition tables; the records
//! themselves are plain data.

use common::util::time::now_ms;
use common::{BranchId, BranchStatus, BranchType, GlobalStatus};
use getset::{Getters, Setters};
use serde::{Deserialize, Serialize};
use std::fmt;
use typed_builder::TypedBuilder;

/// Durable record of a distributed transaction.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, Setters, TypedBuilder,
)]
#[getset(get = "pub", set = "pub")]
pub struct GlobalTransaction {
    /// Globally unique, formatted `applicationId:epochMs:seq`.
    pub xid: String,
    pub status: GlobalStatus,
    pub application_id: String,
    pub transaction_name: String,
    /// Already clamped into [1 s, 300 s] by the coordinator.
    pub timeout_ms: u64,
    #[builder(default = now_ms())]
    pub begin_time_ms: u64,
    #[builder(default)]
    pub application_data: Option<String>,
}

impl GlobalTransaction {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True once `timeout_ms` has elapsed since begin.
    pub fn is_expired(&self, now: u64) -> bool {
        !self.is_terminal() && now.saturating_sub(self.begin_time_ms) >= self.timeout_ms
    }
}

impl fmt::Display for GlobalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalTransaction {{ xid: {}, status: {} }}", self.xid, self.status)
    }
}

/// One participant in a global transaction.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, Setters, TypedBuilder,
)]
#[getset(get = "pub", set = "pub")]
pub struct BranchTransaction {
    pub branch_id: BranchId,
    pub xid: String,
    #[builder(default = common::context::DEFAULT_RESOURCE_GROUP.to_string())]
    pub resource_group_id: String,
    /// Opaque identifier understood by exactly one resource-type handler.
    pub resource_id: String,
    pub branch_type: BranchType,
    /// AT only: comma-separated `table:pk` tuples.
    #[builder(default)]
    pub lock_key: Option<String>,
    #[builder(default = BranchStatus::Registered)]
    pub status: BranchStatus,
    #[builder(default)]
    pub application_data: Option<String>,
    #[builder(default = now_ms())]
    pub begin_time_ms: u64,
    #[builder(default)]
    pub end_time_ms: Option<u64>,
    pub timeout_ms: u64,
}

impl BranchTransaction {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        !self.is_terminal()
            && self.status != BranchStatus::Timeout
            && now.saturating_sub(self.begin_time_ms) >= self.timeout_ms
    }
}

impl fmt::Display for BranchTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Branch {{ id: {}, xid: {}, type: {}, status: {} }}",
            self.branch_id, self.xid, self.branch_type, self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(status: GlobalStatus, begin: u64, timeout: u64) -> GlobalTransaction {
        GlobalTransaction::builder()
            .xid("svc:1:1".to_string())
            .status(status)
            .application_id("svc".to_string())
            .transaction_name("order-pay".to_string())
            .timeout_ms(timeout)
            .begin_time_ms(begin)
            .build()
    }

    #[test]
    fn expiry_is_inclusive_at_the_deadline() {
        let tx = global(GlobalStatus::Begin, 1_000, 2_000);
        assert!(!tx.is_expired(2_999));
        assert!(tx.is_expired(3_000));
        assert!(tx.is_expired(10_000));
    }

    #[test]
    fn terminal_transactions_never_expire() {
        let tx = global(GlobalStatus::Committed, 0, 1_000);
        assert!(!tx.is_expired(u64::MAX));
    }

    #[test]
    fn branch_defaults_to_registered() {
        let branch = BranchTransaction::builder()
            .branch_id(BranchId::new(1001))
            .xid("svc:1:1".to_string())
            .resource_id("jdbc:mysql://orders".to_string())
            .branch_type(BranchType::AT)
            .timeout_ms(30_000)
            .build();
        assert_eq!(branch.status, BranchStatus::Registered);
        assert!(!branch.is_terminal());
    }
}
