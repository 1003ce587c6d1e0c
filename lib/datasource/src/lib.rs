//! # Data-source interception
//!
//! AT-mode plumbing around the business database: structured analysis of
//! DML statements, before/after image capture, undo-log persistence in the
//! same local transaction as the business write, and reverse-SQL
//! compensation driven by phase-2 rollback.
//!
//! The interception boundary is narrow on purpose: a [`SqlExecutor`] is the
//! only thing the framework needs from a database driver, and the
//! [`DmlInterceptor`] wraps exactly the DML-execution path. SELECT and DDL
//! bypass interception entirely, as does any statement executed without an
//! active global transaction in the context.

pub mod executor;
pub mod image;
pub mod interceptor;
pub mod sql;
pub mod undo;

pub use executor::{LocalTransaction, MemoryExecutor, SqlExecutor, SqlValue, TableMeta};
pub use image::RecordImage;
pub use interceptor::{BranchRegistrar, BranchRegistration, DmlInterceptor};
pub use sql::{DmlInfo, DmlType};
pub use undo::{UndoLogManager, UndoLogRecord, UndoStatus};
