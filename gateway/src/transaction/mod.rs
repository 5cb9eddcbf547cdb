// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Strictly ordered, single-attempt transaction submission.
//!
//! ```text
//!  submit(account, request)
//!     │
//!     ├─ acquire account lock  (FIFO, held until submission returns)
//!     ├─ next nonce            (NonceSource)
//!     ├─ sign + send           (TransactionSubmitter)
//!     └─ release lock          (guard drop, on every exit path)
//! ```
//!
//! A nonce handed out is never given back: when submission fails after the
//! nonce was allocated the account's sequence keeps a gap rather than risk
//! reusing the value. There is no retry here; the caller owns that decision.

pub mod eth;

use crate::error::{GatewayError, GatewayResult};
use crate::metrics::GatewayMetrics;
use crate::types::{TransactionHandle, TransactionRequest};
use async_trait::async_trait;
use ethers::types::{Address as EthAddress, Bytes, TxHash, U256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Hands out the next nonce for an account, monotonic and gap-free across
/// concurrent callers.
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn next_nonce(&self, account: EthAddress) -> anyhow::Result<U256>;
}

/// Signs a request with the given nonce and sends it to the network.
#[async_trait]
pub trait TransactionSubmitter: Send + Sync {
    async fn sign_and_send(
        &self,
        account: EthAddress,
        request: &TransactionRequest,
        nonce: U256,
    ) -> anyhow::Result<TxHash>;
}

/// Read-only contract calls.
#[async_trait]
pub trait ContractReader: Send + Sync {
    async fn call(&self, request: &TransactionRequest) -> anyhow::Result<Bytes>;
}

/// Waits until a transaction reaches the requested number of confirmations.
/// Returns whether the transaction succeeded.
#[async_trait]
pub trait MiningWaiter: Send + Sync {
    async fn wait_for_confirmations(
        &self,
        tx_hash: TxHash,
        confirmations: usize,
    ) -> anyhow::Result<bool>;
}

/// One lock per account. Gateways that submit from the same account must
/// share one instance.
#[derive(Default)]
pub struct AccountLocks {
    locks: Mutex<HashMap<EthAddress, Arc<Mutex<()>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the account's lock. Waiters are served in arrival order.
    pub async fn acquire(&self, account: EthAddress) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(account).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct TransactionGate {
    nonce_source: Arc<dyn NonceSource>,
    submitter: Arc<dyn TransactionSubmitter>,
    locks: Arc<AccountLocks>,
    metrics: Arc<GatewayMetrics>,
}

impl TransactionGate {
    pub fn new(
        nonce_source: Arc<dyn NonceSource>,
        submitter: Arc<dyn TransactionSubmitter>,
        locks: Arc<AccountLocks>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            nonce_source,
            submitter,
            locks,
            metrics,
        }
    }

    pub async fn submit(
        &self,
        account: EthAddress,
        request: TransactionRequest,
    ) -> GatewayResult<TransactionHandle> {
        let operation = request.operation_name();
        let _timer = self
            .metrics
            .tx_submission_latency
            .with_label_values(&[operation])
            .start_timer();

        let result = self.submit_locked(account, &request).await;
        match &result {
            Ok(handle) => {
                self.metrics
                    .tx_submitted
                    .with_label_values(&[operation])
                    .inc();
                debug!(
                    "[TransactionGate] submitted {} transaction with hash: [{:#x}], nonce={}",
                    operation, handle.tx_hash, handle.nonce
                );
            }
            Err(e) => {
                self.metrics
                    .tx_submission_failures
                    .with_label_values(&[operation])
                    .inc();
                warn!(
                    "[TransactionGate] {} to {:#x} from {:#x} failed ({}): {}",
                    operation,
                    request.target,
                    account,
                    e.error_type(),
                    e
                );
            }
        }
        result
    }

    async fn submit_locked(
        &self,
        account: EthAddress,
        request: &TransactionRequest,
    ) -> GatewayResult<TransactionHandle> {
        let wait_start = Instant::now();
        // Released when this function returns, whatever the outcome
        let _guard = self.locks.acquire(account).await;
        debug!(
            "[TransactionGate] Acquired lock for {:#x} after {:?}",
            account,
            wait_start.elapsed()
        );

        let nonce = self.nonce_source.next_nonce(account).await.map_err(|e| {
            GatewayError::Submission(format!(
                "failed to allocate nonce for {:#x}: {:?}",
                account, e
            ))
        })?;

        let tx_hash = self
            .submitter
            .sign_and_send(account, request, nonce)
            .await
            .map_err(|e| {
                info!(
                    "[TransactionGate] Nonce {} of {:#x} consumed by failed {}",
                    nonce,
                    account,
                    request.operation_name()
                );
                GatewayError::Submission(format!(
                    "{} submission with nonce {} failed: {:?}",
                    request.operation_name(),
                    nonce,
                    e
                ))
            })?;

        Ok(TransactionHandle {
            tx_hash,
            nonce,
            account,
            target: request.target,
            operation: request.operation,
        })
    }
}
