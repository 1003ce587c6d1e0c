use crate::core::CoordinatorRef;
use crate::server::ConnectionId;
use anyhow::Result;
use common::TxError;
use dashmap::DashMap;
use protocol::{Codec, FrameCodec, Payload, ResponseCode, RpcMessage, TxResponse};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

/// One connected client. Reads frames, dispatches to the coordinator and
/// answers `Result` messages carrying the request's id. Any framing
/// violation drops the connection.
pub struct ConnectionHandler {
    connection_id: ConnectionId,
    stream: TcpStream,
    coordinator: CoordinatorRef,
    connections: Arc<DashMap<ConnectionId, SocketAddr>>,
    codec: Arc<dyn Codec>,
}

impl ConnectionHandler {
    pub fn new(
        connection_id: ConnectionId,
        stream: TcpStream,
        coordinator: CoordinatorRef,
        connections: Arc<DashMap<ConnectionId, SocketAddr>>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            connection_id,
            stream,
            coordinator,
            connections,
            codec,
        }
    }

    pub async fn handle_connection(mut self) -> Result<()> {
        loop {
            match FrameCodec::read(&mut self.stream, self.codec.as_ref()).await {
                Ok(Some(message)) => {
                    let reply = self.process_message(&message).await;
                    FrameCodec::write(&mut self.stream, &reply, self.codec.as_ref()).await?;
                }
                Ok(None) => {
                    self.handle_disconnect().await?;
                    break;
                }
                Err(err) => {
                    // bad magic, bad version, unknown type, garbled body:
                    // the connection is beyond trusting
                    warn!(error = %err, "closing connection on wire error");
                    self.handle_disconnect().await?;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_disconnect(&mut self) -> Result<()> {
        let peer = self.connections.remove(&self.connection_id).map(|(_, addr)| addr);
        let remaining = self.connections.len();
        match peer {
            Some(peer) => info!(
                "Client {} disconnected. {} connections remaining.",
                peer, remaining
            ),
            None => debug!(connection_id = self.connection_id, "connection already deregistered"),
        }
        Ok(())
    }

    #[instrument(skip(self, message), fields(kind = %message.kind(), id = *message.id()))]
    async fn process_message(&mut self, message: &RpcMessage) -> RpcMessage {
        debug!("Processing message: {}", message);

        let response = match message.payload() {
            Payload::GlobalBegin(begin) => self
                .coordinator
                .begin(
                    begin.application_id(),
                    begin.transaction_name(),
                    *begin.timeout_ms(),
                )
                .await
                .map(TxResponse::ok_with_xid)
                .unwrap_or_else(failure),
            Payload::BranchRegister(register) => self
                .coordinator
                .register_branch(
                    register.xid(),
                    register.resource_id(),
                    *register.branch_type(),
                    register.lock_key().clone(),
                    register.application_data().clone(),
                )
                .await
                .map(TxResponse::ok_with_branch)
                .unwrap_or_else(failure),
            Payload::BranchStatusReport(report) => self
                .coordinator
                .report_branch(report.xid(), *report.branch_id(), *report.status())
                .await
                .map(|()| TxResponse::ok())
                .unwrap_or_else(failure),
            Payload::GlobalCommit(commit) => self
                .coordinator
                .global_commit(commit.xid())
                .await
                .map(TxResponse::ok_with_status)
                .unwrap_or_else(failure),
            Payload::GlobalRollback(rollback) => self
                .coordinator
                .global_rollback(rollback.xid())
                .await
                .map(TxResponse::ok_with_status)
                .unwrap_or_else(failure),
            Payload::GlobalStatus(status) => self
                .coordinator
                .global_status(status.xid())
                .await
                .map(TxResponse::ok_with_status)
                .unwrap_or_else(failure),
            Payload::Result(_) => {
                warn!("client sent a Result message; answering with a protocol error");
                TxResponse::failed(ResponseCode::ProtocolError, "unexpected Result message")
            }
        };

        message.reply(response)
    }
}

fn failure(err: TxError) -> TxResponse {
    TxResponse::failed(ResponseCode::from(err.kind()), err.to_string())
}
