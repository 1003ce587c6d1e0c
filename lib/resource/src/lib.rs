//! # Resource-manager dispatch
//!
//! Phase-2 of the protocol: once the coordinator decides a global
//! transaction's fate, every branch is driven to commit or roll back by the
//! handler for its resource family. Five families are supported — AT
//! (undo-log compensation), TCC (registered confirm/cancel services), XA
//! (driver-level two-phase commit), MQ (half-message confirm/discard) and
//! HTTP (remote confirm/cancel endpoints).
//!
//! Every attempt yields a [`CommunicationResult`]; the dispatcher retries
//! retryable outcomes with exponential backoff up to a per-family attempt
//! ceiling, then reports failure. A branch failure never aborts the global
//! driver — the transaction terminates `CommitFailed`/`RollbackFailed` and
//! is flagged for the operator.

pub mod at;
pub mod dispatch;
pub mod http;
pub mod mq;
pub mod resolver;
pub mod tcc;
pub mod xa;

pub use at::AtResourceHandler;
pub use dispatch::{
    BranchDispatcher, CommunicationResult, CommunicationStatus, PhaseTwoOp, ResourceHandler,
};
pub use http::{HttpAuth, HttpResourceHandler};
pub use mq::{MqBroker, MqResourceHandler};
pub use resolver::{AddressResolver, StaticResolver};
pub use tcc::{ServiceContainer, TccInvocation, TccRegistry, TccResourceHandler, TccService};
pub use xa::{XaConnection, XaResourceHandler};
