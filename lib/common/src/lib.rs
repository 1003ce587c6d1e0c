//! Shared vocabulary for the keystone workspace: configuration, typed ids,
//! transaction statuses, the flat error taxonomy and the execution context
//! that carries an active global transaction across components.

pub mod config;
pub mod context;
pub mod error;
pub mod ids;
pub mod types;
pub mod util;

pub use config::TxConfig;
pub use context::TxContext;
pub use error::{ErrorKind, TxError, TxResult};
pub use ids::{BranchId, BranchIdAllocator, XidGenerator};
pub use types::{BranchStatus, BranchType, GlobalStatus};
