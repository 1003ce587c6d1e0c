//! Pluggable body serialization. The codec must be symmetric:
//! `decode(kind, encode(p)) == p` for every payload shape.

use crate::message::{
    BeginRequest, BranchRegisterRequest, BranchReportRequest, GlobalCommitRequest,
    GlobalRollbackRequest, GlobalStatusRequest, MessageKind, Payload, TxResponse,
};
use common::TxResult;

/// Wire tag of the codec in use; new codecs (Hessian, MessagePack, ...) plug
/// in behind the same trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Json = 1,
}

pub trait Codec: Send + Sync {
    fn kind(&self) -> CodecKind;

    fn encode(&self, payload: &Payload) -> TxResult<Vec<u8>>;

    /// The message type from the frame header selects the body shape.
    fn decode(&self, kind: MessageKind, body: &[u8]) -> TxResult<Payload>;
}

/// Default codec: one JSON document per body.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Json
    }

    fn encode(&self, payload: &Payload) -> TxResult<Vec<u8>> {
        let bytes = match payload {
            Payload::GlobalBegin(body) => serde_json::to_vec(body),
            Payload::GlobalCommit(body) => serde_json::to_vec(body),
            Payload::GlobalRollback(body) => serde_json::to_vec(body),
            Payload::GlobalStatus(body) => serde_json::to_vec(body),
            Payload::BranchRegister(body) => serde_json::to_vec(body),
            Payload::BranchStatusReport(body) => serde_json::to_vec(body),
            Payload::Result(body) => serde_json::to_vec(body),
        }?;
        Ok(bytes)
    }

    fn decode(&self, kind: MessageKind, body: &[u8]) -> TxResult<Payload> {
        let payload = match kind {
            MessageKind::GlobalBegin => {
                Payload::GlobalBegin(serde_json::from_slice::<BeginRequest>(body)?)
            }
            MessageKind::GlobalCommit => {
                Payload::GlobalCommit(serde_json::from_slice::<GlobalCommitRequest>(body)?)
            }
            MessageKind::GlobalRollback => {
                Payload::GlobalRollback(serde_json::from_slice::<GlobalRollbackRequest>(body)?)
            }
            MessageKind::GlobalStatus => {
                Payload::GlobalStatus(serde_json::from_slice::<GlobalStatusRequest>(body)?)
            }
            MessageKind::BranchRegister => {
                Payload::BranchRegister(serde_json::from_slice::<BranchRegisterRequest>(body)?)
            }
            MessageKind::BranchStatusReport => {
                Payload::BranchStatusReport(serde_json::from_slice::<BranchReportRequest>(body)?)
            }
            MessageKind::Result => Payload::Result(serde_json::from_slice::<TxResponse>(body)?),
        };
        Ok(payload)
    }
}

impl JsonCodec {
    pub fn boxed() -> Box<dyn Codec> {
        Box::new(JsonCodec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BranchId, BranchStatus, BranchType, ErrorKind, GlobalStatus};

    fn all_payloads() -> Vec<Payload> {
        vec![
            Payload::GlobalBegin(
                BeginRequest::builder()
                    .application_id("svc".into())
                    .transaction_name("order-pay".into())
                    .timeout_ms(10_000)
                    .build(),
            ),
            Payload::GlobalCommit(GlobalCommitRequest::builder().xid("svc:1:1".into()).build()),
            Payload::GlobalRollback(
                GlobalRollbackRequest::builder().xid("svc:1:1".into()).build(),
            ),
            Payload::GlobalStatus(GlobalStatusRequest::builder().xid("svc:1:1".into()).build()),
            Payload::BranchRegister(
                BranchRegisterRequest::builder()
                    .xid("svc:1:1".into())
                    .resource_id("jdbc:mysql://orders".into())
                    .branch_type(BranchType::AT)
                    .lock_key("account:1".into())
                    .build(),
            ),
            Payload::BranchStatusReport(
                BranchReportRequest::builder()
                    .xid("svc:1:1".into())
                    .branch_id(BranchId::new(1001))
                    .status(BranchStatus::PhaseOneDone)
                    .build(),
            ),
            Payload::Result(TxResponse::ok_with_status(GlobalStatus::Committed)),
        ]
    }

    #[test]
    fn every_payload_round_trips() {
        let codec = JsonCodec;
        for payload in all_payloads() {
            let bytes = codec.encode(&payload).unwrap();
            let decoded = codec.decode(payload.kind(), &bytes).unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn garbled_bodies_surface_protocol_errors() {
        let codec = JsonCodec;
        let err = codec
            .decode(MessageKind::GlobalBegin, b"{not json")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn optional_fields_survive_the_trip() {
        let codec = JsonCodec;
        let payload = Payload::BranchRegister(
            BranchRegisterRequest::builder()
                .xid("svc:2:9".into())
                .resource_id("inv".into())
                .branch_type(BranchType::TCC)
                .build(),
        );
        let decoded = codec
            .decode(MessageKind::BranchRegister, &codec.encode(&payload).unwrap())
            .unwrap();
        assert_eq!(decoded, payload);
    }
}
