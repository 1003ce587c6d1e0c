use crate::util::time::now_ms;
use serde::{Deserialize, Serialize};
use shrinkwraprs::Shrinkwrap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Unique identifier for a branch within a global transaction. The high 48
/// bits carry the allocation instant in epoch milliseconds, the low 16 bits
/// a wrapping per-process sequence.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Shrinkwrap,
)]
pub struct BranchId(pub i64);

impl BranchId {
    pub fn new(branch_id: i64) -> Self {
        Self(branch_id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for BranchId {
    fn from(branch_id: i64) -> Self {
        Self(branch_id)
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates xids of the shape `applicationId:epochMs:seq`. The sequence is
/// process-monotonic so two Begin calls in the same millisecond still get
/// distinct xids.
#[derive(Debug, Default)]
pub struct XidGenerator {
    sequence: AtomicU64,
}

impl XidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_xid(&self, application_id: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}:{}:{}", application_id, now_ms(), seq)
    }
}

/// Snowflake-style branch-id allocator: epoch milliseconds shifted into the
/// high bits, a wrapping 16-bit sequence in the low bits. Unique within one
/// coordinator process; a database sequence is the multi-node option.
#[derive(Debug, Default)]
pub struct BranchIdAllocator {
    sequence: AtomicU32,
}

impl BranchIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> BranchId {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
        let millis = now_ms() as i64 & 0x7FFF_FFFF_FFFF;
        BranchId(millis << 16 | seq as i64)
    }
}
