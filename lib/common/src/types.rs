//! Status vocabulary shared by the coordinator, the store, the wire protocol
//! and the client. The transition tables here are the single source of truth
//! for both state machines; the store refuses writes that violate them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a global transaction. Driven exclusively by the coordinator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum GlobalStatus {
    Begin,
    Committing,
    Committed,
    CommitFailed,
    Rollbacking,
    Rollbacked,
    RollbackFailed,
    TimeoutRollbacking,
    TimeoutRollbacked,
    /// Terminal record already purged (or acknowledged); queries for an
    /// unknown xid report this rather than an error.
    Finished,
}

impl GlobalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GlobalStatus::Committed
                | GlobalStatus::CommitFailed
                | GlobalStatus::Rollbacked
                | GlobalStatus::RollbackFailed
                | GlobalStatus::TimeoutRollbacked
                | GlobalStatus::Finished
        )
    }

    /// Whether the transaction still accepts begin-side mutation
    /// (branch registration, phase-1 reports).
    pub fn is_active(&self) -> bool {
        matches!(self, GlobalStatus::Begin)
    }

    pub fn can_transition_to(&self, next: GlobalStatus) -> bool {
        use GlobalStatus::*;
        match (self, next) {
            (Begin, Committing) | (Begin, Rollbacking) | (Begin, TimeoutRollbacking) => true,
            (Committing, Committed) | (Committing, CommitFailed) => true,
            (Rollbacking, Rollbacked) | (Rollbacking, RollbackFailed) => true,
            (TimeoutRollbacking, TimeoutRollbacked)
            | (TimeoutRollbacking, RollbackFailed) => true,
            (s, Finished) if s.is_terminal() => true,
            _ => false,
        }
    }
}

impl fmt::Display for GlobalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Lifecycle of a single branch. The coordinator owns every transition;
/// resource managers only report the phase-1 outcome.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum BranchStatus {
    Registered,
    PhaseOneDone,
    PhaseOneFailed,
    PhaseTwoCommitting,
    PhaseTwoCommitted,
    PhaseTwoCommitFailed,
    PhaseTwoRollbacking,
    PhaseTwoRollbacked,
    PhaseTwoRollbackFailed,
    Timeout,
}

impl BranchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BranchStatus::PhaseOneFailed
                | BranchStatus::PhaseTwoCommitted
                | BranchStatus::PhaseTwoCommitFailed
                | BranchStatus::PhaseTwoRollbacked
                | BranchStatus::PhaseTwoRollbackFailed
        )
    }

    /// Branches in these states may still be driven through phase-2.
    pub fn phase_two_eligible(&self) -> bool {
        matches!(
            self,
            BranchStatus::Registered | BranchStatus::PhaseOneDone | BranchStatus::Timeout
        )
    }

    pub fn can_transition_to(&self, next: BranchStatus) -> bool {
        use BranchStatus::*;
        match (self, next) {
            (Registered, PhaseOneDone) | (Registered, PhaseOneFailed) => true,
            (Registered, PhaseTwoCommitting) | (Registered, PhaseTwoRollbacking) => true,
            (PhaseOneDone, PhaseTwoCommitting) | (PhaseOneDone, PhaseTwoRollbacking) => true,
            (Timeout, PhaseTwoRollbacking) => true,
            (PhaseTwoCommitting, PhaseTwoCommitted)
            | (PhaseTwoCommitting, PhaseTwoCommitFailed) => true,
            (PhaseTwoRollbacking, PhaseTwoRollbacked)
            | (PhaseTwoRollbacking, PhaseTwoRollbackFailed) => true,
            (s, Timeout) if !s.is_terminal() && *s != Timeout => true,
            _ => false,
        }
    }
}

impl fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The five resource families a branch can belong to. The dispatcher routes
/// phase-2 work by this tag.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum BranchType {
    AT,
    TCC,
    XA,
    MQ,
    HTTP,
}

impl fmt::Display for BranchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BranchType::AT => "AT",
            BranchType::TCC => "TCC",
            BranchType::XA => "XA",
            BranchType::MQ => "MQ",
            BranchType::HTTP => "HTTP",
        };
        write!(f, "{}", name)
    }
}
