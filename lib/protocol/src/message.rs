use common::{BranchId, BranchStatus, BranchType, ErrorKind, GlobalStatus};
use core::fmt;
use getset::{Getters, Setters};
use serde::{Deserialize, Serialize};
use tracing::warn;
use typed_builder::TypedBuilder;

/// Represents the different kinds of messages in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Open a new global transaction; answered with the allocated xid.
    GlobalBegin = 10,
    /// Drive phase-2 commit for a global transaction.
    GlobalCommit = 11,
    /// Drive phase-2 rollback for a global transaction.
    GlobalRollback = 12,
    /// Query the current status of a global transaction.
    GlobalStatus = 13,
    /// Enlist a branch; AT lock keys are acquired before the reply.
    BranchRegister = 20,
    /// Report a branch's phase-1 outcome.
    BranchStatusReport = 21,
    /// Response to any request, correlated by message id.
    Result = 100,
}

impl MessageKind {
    /// Decode a wire discriminant. Unknown values yield `None` and the
    /// connection is closed by the caller.
    pub fn from_u8(byte: u8) -> Option<MessageKind> {
        match byte {
            10 => Some(MessageKind::GlobalBegin),
            11 => Some(MessageKind::GlobalCommit),
            12 => Some(MessageKind::GlobalRollback),
            13 => Some(MessageKind::GlobalStatus),
            20 => Some(MessageKind::BranchRegister),
            21 => Some(MessageKind::BranchStatusReport),
            100 => Some(MessageKind::Result),
            _ => {
                warn!("Unknown message type: {}", byte);
                None
            }
        }
    }

    pub fn to_u8(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            MessageKind::GlobalBegin => "GlobalBegin",
            MessageKind::GlobalCommit => "GlobalCommit",
            MessageKind::GlobalRollback => "GlobalRollback",
            MessageKind::GlobalStatus => "GlobalStatus",
            MessageKind::BranchRegister => "BranchRegister",
            MessageKind::BranchStatusReport => "BranchStatusReport",
            MessageKind::Result => "Result",
        };
        write!(f, "{}", kind)
    }
}

/// Request to open a global transaction.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, Setters, TypedBuilder,
)]
#[getset(get = "pub", set = "pub")]
pub struct BeginRequest {
    pub application_id: String,
    pub transaction_name: String,
    /// Caller's timeout; clamped server-side, 0 means "use the default".
    #[builder(default)]
    pub timeout_ms: u64,
}

/// Request to enlist a branch in an open global transaction.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, Setters, TypedBuilder,
)]
#[getset(get = "pub", set = "pub")]
pub struct BranchRegisterRequest {
    pub xid: String,
    pub resource_id: String,
    pub branch_type: BranchType,
    /// AT only: comma-separated `table:pk,...` tuples.
    #[builder(default, setter(strip_option))]
    pub lock_key: Option<String>,
    #[builder(default, setter(strip_option))]
    pub application_data: Option<String>,
}

/// Phase-1 outcome report for a registered branch.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, Setters, TypedBuilder,
)]
#[getset(get = "pub", set = "pub")]
pub struct BranchReportRequest {
    pub xid: String,
    pub branch_id: BranchId,
    pub status: BranchStatus,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, Setters, TypedBuilder,
)]
#[getset(get = "pub", set = "pub")]
pub struct GlobalCommitRequest {
    pub xid: String,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, Setters, TypedBuilder,
)]
#[getset(get = "pub", set = "pub")]
pub struct GlobalRollbackRequest {
    pub xid: String,
}

#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, Setters, TypedBuilder,
)]
#[getset(get = "pub", set = "pub")]
pub struct GlobalStatusRequest {
    pub xid: String,
}

/// Outcome tag of a `Result` message. Mirrors the error taxonomy closely
/// enough for the client to rebuild a typed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    Ok,
    GlobalNotFound,
    GlobalNotActive,
    BranchNotFound,
    LockConflict,
    Timeout,
    ProtocolError,
    Internal,
}

impl From<ErrorKind> for ResponseCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::GlobalNotFound => ResponseCode::GlobalNotFound,
            ErrorKind::GlobalNotActive => ResponseCode::GlobalNotActive,
            ErrorKind::BranchNotFound => ResponseCode::BranchNotFound,
            ErrorKind::LockConflict => ResponseCode::LockConflict,
            ErrorKind::Timeout => ResponseCode::Timeout,
            ErrorKind::Wire | ErrorKind::Protocol | ErrorKind::UnsupportedSql => {
                ResponseCode::ProtocolError
            }
            _ => ResponseCode::Internal,
        }
    }
}

impl ResponseCode {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ResponseCode::Ok => None,
            ResponseCode::GlobalNotFound => Some(ErrorKind::GlobalNotFound),
            ResponseCode::GlobalNotActive => Some(ErrorKind::GlobalNotActive),
            ResponseCode::BranchNotFound => Some(ErrorKind::BranchNotFound),
            ResponseCode::LockConflict => Some(ErrorKind::LockConflict),
            ResponseCode::Timeout => Some(ErrorKind::Timeout),
            ResponseCode::ProtocolError => Some(ErrorKind::Protocol),
            ResponseCode::Internal => Some(ErrorKind::Internal),
        }
    }
}

/// Response body shared by all request kinds; unused fields stay `None`.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, Setters, TypedBuilder,
)]
#[getset(get = "pub", set = "pub")]
pub struct TxResponse {
    pub code: ResponseCode,
    #[builder(default, setter(strip_option))]
    pub message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub xid: Option<String>,
    #[builder(default, setter(strip_option))]
    pub branch_id: Option<BranchId>,
    #[builder(default, setter(strip_option))]
    pub status: Option<GlobalStatus>,
}

impl TxResponse {
    pub fn ok() -> Self {
        TxResponse::builder().code(ResponseCode::Ok).build()
    }

    pub fn ok_with_xid(xid: impl Into<String>) -> Self {
        TxResponse::builder()
            .code(ResponseCode::Ok)
            .xid(xid.into())
            .build()
    }

    pub fn ok_with_branch(branch_id: BranchId) -> Self {
        TxResponse::builder()
            .code(ResponseCode::Ok)
            .branch_id(branch_id)
            .build()
    }

    pub fn ok_with_status(status: GlobalStatus) -> Self {
        TxResponse::builder()
            .code(ResponseCode::Ok)
            .status(status)
            .build()
    }

    pub fn failed(code: ResponseCode, message: impl Into<String>) -> Self {
        TxResponse::builder()
            .code(code)
            .message(message.into())
            .build()
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResponseCode::Ok
    }
}

/// A decoded message body. The variant determines the wire discriminant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    GlobalBegin(BeginRequest),
    GlobalCommit(GlobalCommitRequest),
    GlobalRollback(GlobalRollbackRequest),
    GlobalStatus(GlobalStatusRequest),
    BranchRegister(BranchRegisterRequest),
    BranchStatusReport(BranchReportRequest),
    Result(TxResponse),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::GlobalBegin(_) => MessageKind::GlobalBegin,
            Payload::GlobalCommit(_) => MessageKind::GlobalCommit,
            Payload::GlobalRollback(_) => MessageKind::GlobalRollback,
            Payload::GlobalStatus(_) => MessageKind::GlobalStatus,
            Payload::BranchRegister(_) => MessageKind::BranchRegister,
            Payload::BranchStatusReport(_) => MessageKind::BranchStatusReport,
            Payload::Result(_) => MessageKind::Result,
        }
    }
}

/// One request or response as it travels the wire.
#[derive(Debug, Clone, PartialEq, Eq, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct RpcMessage {
    /// Correlates a response to its request; monotonic per connection.
    pub id: u32,
    pub payload: Payload,
}

impl RpcMessage {
    pub fn new(id: u32, payload: Payload) -> Self {
        RpcMessage::builder().id(id).payload(payload).build()
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// The `Result` answer to this request, reusing its id.
    pub fn reply(&self, response: TxResponse) -> RpcMessage {
        RpcMessage::new(self.id, Payload::Result(response))
    }
}

impl fmt::Display for RpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_match_the_wire_table() {
        assert_eq!(MessageKind::GlobalBegin.to_u8(), 10);
        assert_eq!(MessageKind::GlobalCommit.to_u8(), 11);
        assert_eq!(MessageKind::GlobalRollback.to_u8(), 12);
        assert_eq!(MessageKind::GlobalStatus.to_u8(), 13);
        assert_eq!(MessageKind::BranchRegister.to_u8(), 20);
        assert_eq!(MessageKind::BranchStatusReport.to_u8(), 21);
        assert_eq!(MessageKind::Result.to_u8(), 100);
    }

    #[test]
    fn unknown_discriminants_are_rejected() {
        assert_eq!(MessageKind::from_u8(0), None);
        assert_eq!(MessageKind::from_u8(99), None);
        for known in [10u8, 11, 12, 13, 20, 21, 100] {
            assert_eq!(MessageKind::from_u8(known).map(|k| k.to_u8()), Some(known));
        }
    }

    #[test]
    fn reply_preserves_the_request_id() {
        let request = RpcMessage::new(
            7,
            Payload::GlobalStatus(GlobalStatusRequest::builder().xid("svc:1:1".into()).build()),
        );
        let reply = request.reply(TxResponse::ok_with_status(GlobalStatus::Committed));
        assert_eq!(*reply.id(), 7);
        assert_eq!(reply.kind(), MessageKind::Result);
    }

    #[test]
    fn response_codes_round_trip_to_error_kinds() {
        assert_eq!(
            ResponseCode::from(ErrorKind::LockConflict).error_kind(),
            Some(ErrorKind::LockConflict)
        );
        assert_eq!(ResponseCode::Ok.error_kind(), None);
    }
}
