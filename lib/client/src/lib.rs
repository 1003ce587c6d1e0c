//! # Client-side transaction manager
//!
//! [`TcClient`] owns one persistent connection to the coordinator, a
//! monotonic message-id generator and a pending-request map: the send path
//! inserts a completion slot, a background reader task resolves it when the
//! correlated `Result` frame arrives, and a per-call deadline expires the
//! slot with a timeout. Every public operation is async and therefore
//! already a future; no separate "async variant" surface is needed.
//!
//! [`GlobalTransactionScope`] is the method-level wrapper: begin before the
//! business closure, commit on success, rollback on error, context unwound
//! on every path.

pub mod scope;

pub use scope::GlobalTransactionScope;

use async_trait::async_trait;
use common::{
    BranchId, BranchStatus, BranchType, ErrorKind, GlobalStatus, TxConfig, TxError, TxResult,
};
use dashmap::DashMap;
use datasource::{BranchRegistrar, BranchRegistration};
use protocol::{
    BeginRequest, BranchRegisterRequest, BranchReportRequest, Codec, FrameCodec,
    GlobalCommitRequest, GlobalRollbackRequest, GlobalStatusRequest, JsonCodec, Payload,
    RpcMessage, TxResponse,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<DashMap<u32, oneshot::Sender<TxResponse>>>;

/// A connected transaction-manager client.
pub struct TcClient {
    server_address: String,
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingMap,
    next_id: AtomicU32,
    codec: Arc<dyn Codec>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl TcClient {
    /// Connects with the default 5 s per-request deadline.
    pub async fn connect(server_address: &str) -> TxResult<Arc<Self>> {
        Self::connect_with_timeout(server_address, DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Connects with the per-request deadline from `rpc.request_timeout_ms`.
    pub async fn connect_with_config(
        server_address: &str,
        config: &TxConfig,
    ) -> TxResult<Arc<Self>> {
        Self::connect_with_timeout(
            server_address,
            Duration::from_millis(*config.rpc().request_timeout_ms()),
        )
        .await
    }

    pub async fn connect_with_timeout(
        server_address: &str,
        request_timeout: Duration,
    ) -> TxResult<Arc<Self>> {
        let stream = TcpStream::connect(server_address).await.map_err(|e| {
            TxError::new(ErrorKind::Network, e.to_string()).with_remote(server_address)
        })?;
        info!(server = server_address, "connected to coordinator");

        let (read_half, write_half) = stream.into_split();
        let pending: PendingMap = Arc::new(DashMap::new());
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
        let reader = tokio::spawn(read_loop(read_half, pending.clone(), codec.clone()));

        Ok(Arc::new(Self {
            server_address: server_address.to_string(),
            writer: Mutex::new(write_half),
            pending,
            next_id: AtomicU32::new(0),
            codec,
            request_timeout,
            reader,
        }))
    }

    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    /// One request/response exchange. The pending slot is inserted before
    /// the frame leaves so a fast response can never miss it, and removed on
    /// every exit path.
    async fn call(&self, payload: Payload) -> TxResult<TxResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (done, wait) = oneshot::channel();
        self.pending.insert(id, done);

        let message = RpcMessage::new(id, payload);
        trace!(%message, "sending request");
        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = FrameCodec::write(&mut *writer, &message, self.codec.as_ref()).await
            {
                self.pending.remove(&id);
                return Err(err);
            }
        }

        match timeout(self.request_timeout, wait).await {
            Ok(Ok(response)) => check(response),
            Ok(Err(_)) => Err(TxError::new(
                ErrorKind::Network,
                "connection closed while awaiting response",
            )
            .with_remote(&self.server_address)),
            Err(_) => {
                self.pending.remove(&id);
                Err(TxError::new(
                    ErrorKind::Timeout,
                    format!("no response within {:?}", self.request_timeout),
                )
                .with_remote(&self.server_address))
            }
        }
    }

    pub async fn begin_global(
        &self,
        application_id: &str,
        transaction_name: &str,
        timeout_ms: u64,
    ) -> TxResult<String> {
        let response = self
            .call(Payload::GlobalBegin(
                BeginRequest::builder()
                    .application_id(application_id.to_string())
                    .transaction_name(transaction_name.to_string())
                    .timeout_ms(timeout_ms)
                    .build(),
            ))
            .await?;
        response
            .xid()
            .clone()
            .ok_or_else(|| TxError::new(ErrorKind::Protocol, "begin response carried no xid"))
    }

    pub async fn commit_global(&self, xid: &str) -> TxResult<GlobalStatus> {
        let response = self
            .call(Payload::GlobalCommit(
                GlobalCommitRequest::builder().xid(xid.to_string()).build(),
            ))
            .await?;
        status_of(response)
    }

    pub async fn rollback_global(&self, xid: &str) -> TxResult<GlobalStatus> {
        let response = self
            .call(Payload::GlobalRollback(
                GlobalRollbackRequest::builder().xid(xid.to_string()).build(),
            ))
            .await?;
        status_of(response)
    }

    pub async fn global_status(&self, xid: &str) -> TxResult<GlobalStatus> {
        let response = self
            .call(Payload::GlobalStatus(
                GlobalStatusRequest::builder().xid(xid.to_string()).build(),
            ))
            .await?;
        status_of(response)
    }

    pub async fn register_branch(
        &self,
        xid: &str,
        resource_id: &str,
        branch_type: BranchType,
        lock_key: Option<String>,
        application_data: Option<String>,
    ) -> TxResult<BranchId> {
        let mut request = BranchRegisterRequest::builder()
            .xid(xid.to_string())
            .resource_id(resource_id.to_string())
            .branch_type(branch_type)
            .build();
        request.lock_key = lock_key;
        request.application_data = application_data;

        let response = self.call(Payload::BranchRegister(request)).await?;
        response.branch_id().clone().ok_or_else(|| {
            TxError::new(ErrorKind::Protocol, "register response carried no branch id")
        })
    }

    pub async fn report_branch(
        &self,
        xid: &str,
        branch_id: BranchId,
        status: BranchStatus,
    ) -> TxResult<()> {
        self.call(Payload::BranchStatusReport(
            BranchReportRequest::builder()
                .xid(xid.to_string())
                .branch_id(branch_id)
                .status(status)
                .build(),
        ))
        .await
        .map(|_| ())
    }
}

impl Drop for TcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// The interceptor can enlist branches through this client.
#[async_trait]
impl BranchRegistrar for TcClient {
    async fn register_branch(&self, registration: BranchRegistration) -> TxResult<BranchId> {
        TcClient::register_branch(
            self,
            &registration.xid,
            &registration.resource_id,
            registration.branch_type,
            registration.lock_key,
            registration.application_data,
        )
        .await
    }

    async fn report_branch(
        &self,
        xid: &str,
        branch_id: BranchId,
        status: BranchStatus,
    ) -> TxResult<()> {
        TcClient::report_branch(self, xid, branch_id, status).await
    }
}

async fn read_loop(mut reader: OwnedReadHalf, pending: PendingMap, codec: Arc<dyn Codec>) {
    loop {
        match FrameCodec::read(&mut reader, codec.as_ref()).await {
            Ok(Some(message)) => {
                let id = *message.id();
                match message.payload() {
                    Payload::Result(response) => match pending.remove(&id) {
                        Some((_, slot)) => {
                            let _ = slot.send(response.clone());
                        }
                        None => debug!(id, "response for an expired or unknown request"),
                    },
                    other => warn!(id, kind = %other.kind(), "unexpected non-Result frame"),
                }
            }
            Ok(None) => {
                debug!("coordinator closed the connection");
                break;
            }
            Err(err) => {
                warn!(error = %err, "read loop terminating");
                break;
            }
        }
    }
    // waking every caller: dropping the senders fails their receivers
    pending.clear();
}

fn check(response: TxResponse) -> TxResult<TxResponse> {
    match response.code().error_kind() {
        None => Ok(response),
        Some(kind) => {
            let message = response
                .message()
                .clone()
                .unwrap_or_else(|| "coordinator rejected the request".to_string());
            Err(TxError::new(kind, message))
        }
    }
}

fn status_of(response: TxResponse) -> TxResult<GlobalStatus> {
    response
        .status()
        .clone()
        .ok_or_else(|| TxError::new(ErrorKind::Protocol, "response carried no status"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::ResponseCode;
    use tokio::net::TcpListener;

    /// A scripted coordinator double speaking raw frames.
    async fn spawn_stub<F>(behavior: F) -> String
    where
        F: Fn(RpcMessage) -> Option<RpcMessage> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Ok(Some(message)) = FrameCodec::read(&mut stream, &JsonCodec).await {
                if let Some(reply) = behavior(message) {
                    if FrameCodec::write(&mut stream, &reply, &JsonCodec).await.is_err() {
                        break;
                    }
                }
            }
        });
        format!("{}", addr)
    }

    #[tokio::test]
    async fn responses_are_correlated_by_id() {
        let addr = spawn_stub(|message| {
            let xid = format!("svc:1:{}", message.id());
            Some(message.reply(TxResponse::ok_with_xid(xid)))
        })
        .await;

        let client = TcClient::connect(&addr).await.unwrap();
        let first = client.begin_global("svc", "a", 0).await.unwrap();
        let second = client.begin_global("svc", "b", 0).await.unwrap();
        assert_eq!(first, "svc:1:1");
        assert_eq!(second, "svc:1:2");
    }

    #[tokio::test]
    async fn failure_codes_surface_as_typed_errors() {
        let addr = spawn_stub(|message| {
            Some(message.reply(TxResponse::failed(
                ResponseCode::LockConflict,
                "row account:1 held by another transaction",
            )))
        })
        .await;

        let client = TcClient::connect(&addr).await.unwrap();
        let err = client
            .register_branch("svc:1:1", "rm", BranchType::AT, Some("account:1".into()), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn configured_rpc_timeout_is_honored() {
        let addr = spawn_stub(|_| None).await;

        let config = TxConfig::builder()
            .rpc(
                common::config::RpcConfig::builder()
                    .request_timeout_ms(100)
                    .build(),
            )
            .build();
        let client = TcClient::connect_with_config(&addr, &config).await.unwrap();
        let err = client.global_status("svc:1:1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn silent_coordinator_times_out_the_slot() {
        let addr = spawn_stub(|_| None).await;

        let client = TcClient::connect_with_timeout(&addr, Duration::from_millis(100))
            .await
            .unwrap();
        let err = client.global_status("svc:1:1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        // the expired slot was cleaned up
        assert!(client.pending.is_empty());
    }

    #[tokio::test]
    async fn closed_connection_fails_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // read one frame then slam the door
            let mut stream = stream;
            let _ = FrameCodec::read(&mut stream, &JsonCodec).await;
            drop(stream);
        });

        let client = TcClient::connect(&addr).await.unwrap();
        let err = client.global_status("svc:1:1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Network | ErrorKind::Timeout));
    }
}
