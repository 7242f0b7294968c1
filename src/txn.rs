//! Transaction coordinator.
//!
//! The only write path into the store. Wraps every multi-table mutation in
//! one store transaction with a timeout, retries deadlocks with exponential
//! backoff, and records an audit row per attempt. Audit failures are logged
//! and swallowed; they never fail the transaction itself.
//!
//! Ops receive the boxed transaction handle and must hand it back with
//! their result, so the coordinator can commit or roll back explicitly. If
//! the timeout fires first, the op future is dropped and the handle's drop
//! rolls the transaction back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::TxAudit;
use crate::store::{Store, TxnHandle};
use crate::types::{IsolationLevel, TxStatus};

/// Per-call transaction options
#[derive(Debug, Clone, Copy)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl Default for TxOptions {
    fn default() -> Self {
        TxOptions {
            isolation: IsolationLevel::ReadCommitted,
            timeout_ms: 5_000,
            max_retries: 3,
            retry_base_ms: 100,
        }
    }
}

impl TxOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        TxOptions {
            isolation: IsolationLevel::ReadCommitted,
            timeout_ms: config.transaction_timeout_ms,
            max_retries: config.transaction_max_retries,
            retry_base_ms: config.transaction_retry_base_ms,
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }
}

/// An op future carries the transaction handle through and returns it with
/// the business result
pub type TxOutcome<T> = (TxnHandle, EngineResult<T>);

pub struct TransactionCoordinator {
    store: Arc<dyn Store>,
    defaults: TxOptions,
}

impl TransactionCoordinator {
    pub fn new(store: Arc<dyn Store>, defaults: TxOptions) -> Self {
        Self { store, defaults }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn defaults(&self) -> TxOptions {
        self.defaults
    }

    /// Run `op` inside a transaction with the coordinator's default options
    pub async fn run_default<T, F>(&self, op_name: &str, op: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: Fn(TxnHandle) -> BoxFuture<'static, TxOutcome<T>> + Send + Sync,
    {
        self.run(self.defaults, op_name, op).await
    }

    /// Run `op` inside a transaction.
    ///
    /// Commit on `Ok`, roll back on `Err`. A deadlock (native or injected)
    /// is retried up to `max_retries` times with `retry_base_ms * 2^attempt`
    /// backoff; any other error propagates after rollback.
    pub async fn run<T, F>(&self, opts: TxOptions, op_name: &str, op: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: Fn(TxnHandle) -> BoxFuture<'static, TxOutcome<T>> + Send + Sync,
    {
        let mut attempt: u32 = 0;
        loop {
            match self.attempt(opts, op_name, attempt, &op).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_deadlock() && attempt < opts.max_retries => {
                    let backoff = opts.retry_base_ms.saturating_mul(1u64 << attempt.min(16));
                    tracing::warn!(
                        op = op_name,
                        attempt,
                        backoff_ms = backoff,
                        "deadlock, retrying transaction"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt<T, F>(
        &self,
        opts: TxOptions,
        op_name: &str,
        attempt: u32,
        op: &F,
    ) -> EngineResult<T>
    where
        T: Send + 'static,
        F: Fn(TxnHandle) -> BoxFuture<'static, TxOutcome<T>> + Send + Sync,
    {
        let tx_id = Uuid::new_v4();
        let started_at = Utc::now();
        let txn = self.store.begin(opts.isolation).await?;

        self.audit(tx_id, op_name, opts, attempt, TxStatus::Started, started_at, None)
            .await;

        let deadline = Duration::from_millis(opts.timeout_ms);
        match tokio::time::timeout(deadline, op(txn)).await {
            // Timeout: the op future (and the transaction handle inside it)
            // was just dropped, which rolls the transaction back.
            Err(_elapsed) => {
                let err = EngineError::Timeout(opts.timeout_ms);
                self.audit(
                    tx_id,
                    op_name,
                    opts,
                    attempt,
                    TxStatus::Failed,
                    started_at,
                    Some(err.to_string()),
                )
                .await;
                Err(err)
            }
            Ok((txn, Ok(value))) => match txn.commit().await {
                Ok(()) => {
                    self.audit(
                        tx_id,
                        op_name,
                        opts,
                        attempt,
                        TxStatus::Committed,
                        started_at,
                        None,
                    )
                    .await;
                    Ok(value)
                }
                Err(err) => {
                    self.audit(
                        tx_id,
                        op_name,
                        opts,
                        attempt,
                        TxStatus::Failed,
                        started_at,
                        Some(err.to_string()),
                    )
                    .await;
                    Err(err)
                }
            },
            Ok((txn, Err(err))) => {
                if let Err(rb) = txn.rollback().await {
                    tracing::warn!(op = op_name, error = %rb, "rollback failed");
                }
                self.audit(
                    tx_id,
                    op_name,
                    opts,
                    attempt,
                    TxStatus::RolledBack,
                    started_at,
                    Some(err.to_string()),
                )
                .await;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit(
        &self,
        tx_id: Uuid,
        op_name: &str,
        opts: TxOptions,
        attempt: u32,
        status: TxStatus,
        started_at: chrono::DateTime<Utc>,
        error_message: Option<String>,
    ) {
        let completed = !matches!(status, TxStatus::Started);
        let now = Utc::now();
        let audit = TxAudit {
            tx_id,
            op_name: op_name.to_string(),
            status,
            isolation: opts.isolation,
            started_at,
            completed_at: completed.then_some(now),
            duration_ms: completed.then(|| (now - started_at).num_milliseconds()),
            error_message,
            metadata: json!({ "attempt": attempt }),
        };
        if let Err(err) = self.store.log_transaction(&audit).await {
            tracing::warn!(op = op_name, error = %err, "transaction audit write failed");
        }
    }
}
