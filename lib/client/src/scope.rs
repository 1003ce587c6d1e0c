//! The method-level transaction wrapper: what an annotation-driven
//! interceptor does in other stacks, expressed as a closure scope. Begin
//! binds the xid into an explicit context handed to the business closure;
//! the outcome decides commit or rollback; the binding never escapes the
//! scope.

use crate::TcClient;
use common::{TxContext, TxResult};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct GlobalTransactionScope {
    client: Arc<TcClient>,
    application_id: String,
}

impl GlobalTransactionScope {
    pub fn new(client: Arc<TcClient>, application_id: impl Into<String>) -> Self {
        Self {
            client,
            application_id: application_id.into(),
        }
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    /// Runs `business` inside a fresh global transaction. Success commits,
    /// any error rolls back and is returned to the caller; a rollback
    /// failure is logged but never masks the business error.
    #[instrument(skip(self, business))]
    pub async fn execute<T, F, Fut>(
        &self,
        transaction_name: &str,
        timeout_ms: u64,
        business: F,
    ) -> TxResult<T>
    where
        F: FnOnce(TxContext) -> Fut,
        Fut: Future<Output = TxResult<T>>,
    {
        let xid = self
            .client
            .begin_global(&self.application_id, transaction_name, timeout_ms)
            .await?;

        let mut ctx = TxContext::builder()
            .transaction_name(Some(transaction_name.to_string()))
            .timeout_ms(timeout_ms)
            .build();
        ctx.bind(xid.clone());

        match business(ctx).await {
            Ok(value) => {
                let status = self.client.commit_global(&xid).await?;
                info!(%xid, %status, "global transaction committed");
                Ok(value)
            }
            Err(business_err) => {
                match self.client.rollback_global(&xid).await {
                    Ok(status) => info!(%xid, %status, "global transaction rolled back"),
                    Err(rollback_err) => {
                        warn!(
                            %xid,
                            error = %rollback_err,
                            "rollback failed; transaction left for the timeout scanner"
                        );
                    }
                }
                Err(business_err)
            }
        }
    }
}
