//! # Wire protocol
//!
//! Framed binary RPC between application clients (TM/RM) and the
//! coordinator.
//!
//! ## Frame format
//!
//! _Protocol version 1_
//!
//! All frames have the same fixed 12-byte header followed by a variable
//! body:
//!
//! ```text
//! +--------+---------+-------------+------------+------------+----------+
//! | Magic  | Version | MessageType | MessageId  | BodyLength | Body     |
//! | 0xCAFE | (1 B)   | (1 B)       | (4 B, BE)  | (4 B, BE)  | (N B)    |
//! +--------+---------+-------------+------------+------------+----------+
//! ```
//!
//! - Magic: `0xCAFE`; the connection is closed on mismatch.
//! - Version: currently 1; higher versions are rejected.
//! - MessageId: monotonic per connection; a response carries the id of the
//!   request it answers.
//! - Body: serialized by the negotiated codec (JSON by default).
//!
//! ## Message types
//!
//! | Type |        Name        |            Description             | Data Flow        |
//! | ---- | ------------------ | ---------------------------------- | ---------------- |
//! | 10   | GlobalBegin        | Open a global transaction          | Client -> Server |
//! | 11   | GlobalCommit       | Drive phase-2 commit               | Client -> Server |
//! | 12   | GlobalRollback     | Drive phase-2 rollback             | Client -> Server |
//! | 13   | GlobalStatus       | Query a transaction's status       | Client -> Server |
//! | 20   | BranchRegister     | Enlist a branch (locks acquired)   | Client -> Server |
//! | 21   | BranchStatusReport | Report a branch's phase-1 outcome  | Client -> Server |
//! | 100  | Result             | Response to any request            | Server -> Client |
//!
//! Unknown message types close the connection.

pub mod codec;
pub mod frame;
pub mod message;

pub use codec::{Codec, CodecKind, JsonCodec};
pub use frame::FrameCodec;
pub use message::{
    BeginRequest, BranchRegisterRequest, BranchReportRequest, GlobalCommitRequest,
    GlobalRollbackRequest, GlobalStatusRequest, MessageKind, Payload, ResponseCode, RpcMessage,
    TxResponse,
};
