// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! ethers-backed collaborators for the transaction gate.

use super::{ContractReader, MiningWaiter, NonceSource, TransactionSubmitter};
use crate::types::TransactionRequest;
use anyhow::anyhow;
use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::Middleware;
use ethers::signers::Signer;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address as EthAddress, BlockNumber, Bytes, TransactionRequest as EthTransactionRequest,
    TxHash, U256, U64,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, warn};

/// Seeds each account from its pending transaction count once, then counts
/// locally. Allocated values are never returned. Seeding one account does
/// not hold up the others.
#[derive(Debug)]
pub struct ProviderNonceSource<M> {
    client: Arc<M>,
    // None until the account has been seeded
    next: Mutex<HashMap<EthAddress, Arc<Mutex<Option<U256>>>>>,
}

impl<M> ProviderNonceSource<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self {
            client,
            next: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> NonceSource for ProviderNonceSource<M> {
    async fn next_nonce(&self, account: EthAddress) -> anyhow::Result<U256> {
        let entry = {
            let mut next = self.next.lock().await;
            next.entry(account).or_default().clone()
        };
        let mut next = entry.lock().await;
        let nonce = match *next {
            Some(nonce) => nonce,
            None => {
                let pending = self
                    .client
                    .get_transaction_count(account, Some(BlockNumber::Pending.into()))
                    .await?;
                debug!(
                    "[ProviderNonceSource] Seeded {:#x} with pending nonce {}",
                    account, pending
                );
                pending
            }
        };
        *next = Some(nonce + U256::one());
        Ok(nonce)
    }
}

pub struct SignerSubmitter<M, S> {
    client: Arc<SignerMiddleware<M, S>>,
}

impl<M, S> SignerSubmitter<M, S>
where
    M: Middleware,
    S: Signer,
{
    pub fn new(client: Arc<SignerMiddleware<M, S>>) -> Self {
        Self { client }
    }

    pub fn account(&self) -> EthAddress {
        self.client.address()
    }
}

#[async_trait]
impl<M, S> TransactionSubmitter for SignerSubmitter<M, S>
where
    M: Middleware + 'static,
    S: Signer + 'static,
{
    async fn sign_and_send(
        &self,
        account: EthAddress,
        request: &TransactionRequest,
        nonce: U256,
    ) -> anyhow::Result<TxHash> {
        if account != self.client.address() {
            return Err(anyhow!(
                "signer for {:#x} cannot submit on behalf of {:#x}",
                self.client.address(),
                account
            ));
        }
        let tx = EthTransactionRequest::new()
            .from(account)
            .to(request.target)
            .data(request.calldata())
            .nonce(nonce);
        let pending = self.client.send_transaction(tx, None).await?;
        Ok(pending.tx_hash())
    }
}

pub struct ProviderContractReader<M> {
    client: Arc<M>,
}

impl<M> ProviderContractReader<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ContractReader for ProviderContractReader<M> {
    async fn call(&self, request: &TransactionRequest) -> anyhow::Result<Bytes> {
        let tx: TypedTransaction = EthTransactionRequest::new()
            .to(request.target)
            .data(request.calldata())
            .into();
        Ok(self.client.call(&tx, None).await?)
    }
}

/// Polls for the receipt until it is buried under enough blocks. RPC errors
/// while polling are logged and polled again until the timeout expires.
pub struct ProviderMiningWaiter<M> {
    client: Arc<M>,
    poll_interval: Duration,
    timeout: Duration,
}

impl<M> ProviderMiningWaiter<M> {
    pub fn new(client: Arc<M>, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            client,
            poll_interval,
            timeout,
        }
    }
}

impl<M: Middleware + 'static> ProviderMiningWaiter<M> {
    async fn poll(&self, tx_hash: TxHash, confirmations: usize) -> bool {
        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let receipt = match self.client.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => receipt,
                Ok(None) => {
                    debug!("[ProviderMiningWaiter] {:#x} not mined yet", tx_hash);
                    continue;
                }
                Err(e) => {
                    warn!(
                        "[ProviderMiningWaiter] Receipt query for {:#x} failed: {:?}",
                        tx_hash, e
                    );
                    continue;
                }
            };
            let Some(mined_in) = receipt.block_number else {
                continue;
            };
            let succeeded = receipt.status == Some(U64::from(1));
            // Being mined is the first confirmation
            if confirmations <= 1 {
                return succeeded;
            }
            match self.client.get_block_number().await {
                Ok(latest) => {
                    let depth = latest.as_u64().saturating_sub(mined_in.as_u64()) + 1;
                    if depth >= confirmations as u64 {
                        return succeeded;
                    }
                    debug!(
                        "[ProviderMiningWaiter] {:#x} has {}/{} confirmations",
                        tx_hash, depth, confirmations
                    );
                }
                Err(e) => warn!(
                    "[ProviderMiningWaiter] Block number query failed: {:?}",
                    e
                ),
            }
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> MiningWaiter for ProviderMiningWaiter<M> {
    async fn wait_for_confirmations(
        &self,
        tx_hash: TxHash,
        confirmations: usize,
    ) -> anyhow::Result<bool> {
        time::timeout(self.timeout, self.poll(tx_hash, confirmations))
            .await
            .map_err(|_| {
                anyhow!(
                    "transaction {:#x} did not reach {} confirmations within {:?}",
                    tx_hash,
                    confirmations,
                    self.timeout
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::{JsonRpcClient, MockError, MockProvider, Provider};
    use ethers::types::TransactionReceipt;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_nonce_source_seeds_once_then_counts() {
        let (provider, mock) = Provider::mocked();
        let nonces = ProviderNonceSource::new(Arc::new(provider));
        let account = EthAddress::repeat_byte(1);

        // nothing cached when the seed query fails
        nonces.next_nonce(account).await.unwrap_err();

        mock.push(U256::from(5)).unwrap();
        assert_eq!(nonces.next_nonce(account).await.unwrap(), U256::from(5));
        // no further responses are queued, so these never reach the provider
        assert_eq!(nonces.next_nonce(account).await.unwrap(), U256::from(6));
        assert_eq!(nonces.next_nonce(account).await.unwrap(), U256::from(7));
    }

    // Holds eth_getTransactionCount for one account until released.
    #[derive(Debug, Clone)]
    struct SeedGate {
        inner: MockProvider,
        account: EthAddress,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl JsonRpcClient for SeedGate {
        type Error = MockError;

        async fn request<T, R>(&self, method: &str, params: T) -> Result<R, MockError>
        where
            T: std::fmt::Debug + serde::Serialize + Send + Sync,
            R: serde::de::DeserializeOwned + Send,
        {
            let value = serde_json::to_value(&params)?;
            let account = serde_json::to_value(self.account)?;
            if method == "eth_getTransactionCount" && value[0] == account {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.request(method, params).await
        }
    }

    #[tokio::test]
    async fn test_seeding_one_account_does_not_block_another() {
        let slow = EthAddress::repeat_byte(1);
        let fast = EthAddress::repeat_byte(2);
        let mock = MockProvider::new();
        let gate = SeedGate {
            inner: mock.clone(),
            account: slow,
            entered: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        };
        // answered last to first
        mock.push(U256::from(40)).unwrap();
        mock.push(U256::from(7)).unwrap();
        let nonces = Arc::new(ProviderNonceSource::new(Arc::new(Provider::new(gate.clone()))));

        let slow_nonces = nonces.clone();
        let slow_task = tokio::spawn(async move { slow_nonces.next_nonce(slow).await });
        gate.entered.notified().await;

        let fast_nonce = time::timeout(Duration::from_secs(5), nonces.next_nonce(fast))
            .await
            .expect("seeding another account must not block")
            .unwrap();
        assert_eq!(fast_nonce, U256::from(7));

        gate.release.notify_one();
        assert_eq!(slow_task.await.unwrap().unwrap(), U256::from(40));
        assert_eq!(nonces.next_nonce(slow).await.unwrap(), U256::from(41));
        assert_eq!(nonces.next_nonce(fast).await.unwrap(), U256::from(8));
    }

    #[tokio::test]
    async fn test_mining_waiter_reports_receipt_status() {
        let (provider, mock) = Provider::mocked();
        let waiter = ProviderMiningWaiter::new(
            Arc::new(provider),
            Duration::from_millis(1),
            Duration::from_secs(5),
        );

        mock.push(TransactionReceipt {
            block_number: Some(U64::from(10)),
            status: Some(U64::from(1)),
            ..Default::default()
        })
        .unwrap();
        assert!(waiter
            .wait_for_confirmations(TxHash::repeat_byte(1), 1)
            .await
            .unwrap());

        mock.push(TransactionReceipt {
            block_number: Some(U64::from(10)),
            status: Some(U64::zero()),
            ..Default::default()
        })
        .unwrap();
        assert!(!waiter
            .wait_for_confirmations(TxHash::repeat_byte(1), 1)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_mining_waiter_times_out() {
        let (provider, _mock) = Provider::mocked();
        let waiter = ProviderMiningWaiter::new(
            Arc::new(provider),
            Duration::from_millis(1),
            Duration::from_millis(30),
        );
        let err = waiter
            .wait_for_confirmations(TxHash::repeat_byte(1), 3)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not reach 3 confirmations"));
    }
}
