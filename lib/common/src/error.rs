use std::fmt;
use thiserror::Error;

pub type TxResult<T> = Result<T, TxError>;

/// Discriminator for every failure the framework can surface. Classification
/// (retryability, timeout-ness) keys off this tag rather than a type
/// hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Framing violation: bad magic, unsupported version, oversized body.
    /// The connection is closed; the peer observes `Network`.
    Wire,
    /// I/O failure on a socket: refused, reset, unreachable, EOF mid-frame.
    Network,
    /// Malformed body or unknown message type.
    Protocol,
    /// Credentials rejected by a remote resource.
    Auth,
    /// Global-lock collision on an AT row key.
    LockConflict,
    /// Current row state diverged from the captured after-image during
    /// compensation. Operator escalation.
    DirtyWrite,
    /// Phase-2 rollback found no undo record for the branch.
    NoUndoLog,
    /// resource_id has no registered handler, executor or service.
    ResourceNotFound,
    /// xid does not name a known global transaction.
    GlobalNotFound,
    /// xid names a global transaction that no longer accepts mutation.
    GlobalNotActive,
    /// branch_id does not name a known branch of the given xid.
    BranchNotFound,
    /// The address resolver could not produce a URL for a resource.
    ServiceNotResolvable,
    /// A local deadline elapsed (RPC slot expiry, lock wait exhaustion).
    Timeout,
    /// Statement shape the interceptor cannot analyze.
    UnsupportedSql,
    /// Unexpected programming or runtime error.
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::LockConflict
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ErrorKind::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ErrorKind::Wire => "wire error",
            ErrorKind::Network => "network error",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Auth => "authentication error",
            ErrorKind::LockConflict => "global lock conflict",
            ErrorKind::DirtyWrite => "dirty write",
            ErrorKind::NoUndoLog => "missing undo log",
            ErrorKind::ResourceNotFound => "resource not found",
            ErrorKind::GlobalNotFound => "global transaction not found",
            ErrorKind::GlobalNotActive => "global transaction not active",
            ErrorKind::BranchNotFound => "branch not found",
            ErrorKind::ServiceNotResolvable => "service not resolvable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UnsupportedSql => "unsupported sql",
            ErrorKind::Internal => "internal error",
        };
        write!(f, "{}", kind)
    }
}

/// The single error type of the framework: a flat tagged variant instead of
/// an exception hierarchy. `kind` drives classification; the optional fields
/// carry whatever the failure site knew.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TxError {
    kind: ErrorKind,
    message: String,
    remote_address: Option<String>,
    error_code: Option<u16>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TxError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            remote_address: None,
            error_code: None,
            cause: None,
        }
    }

    pub fn with_remote(mut self, addr: impl Into<String>) -> Self {
        self.remote_address = Some(addr.into());
        self
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    pub fn error_code(&self) -> Option<u16> {
        self.error_code
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_timeout(&self) -> bool {
        self.kind.is_timeout()
    }
}

impl From<std::io::Error> for TxError {
    fn from(err: std::io::Error) -> Self {
        TxError::new(ErrorKind::Network, err.to_string()).with_cause(err)
    }
}

impl From<serde_json::Error> for TxError {
    fn from(err: serde_json::Error) -> Self {
        TxError::new(ErrorKind::Protocol, err.to_string()).with_cause(err)
    }
}
