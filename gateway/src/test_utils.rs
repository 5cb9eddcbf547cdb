// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{GatewayError, GatewayResult};
use crate::events::EventKind;
use crate::log_feed::{FeedUpdate, LogFeed, LogFilter};
use crate::transaction::{ContractReader, MiningWaiter, NonceSource, TransactionSubmitter};
use crate::types::{RawEthLog, TransactionRequest};
use anyhow::anyhow;
use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::{Address as EthAddress, Bytes, Log, TxHash, H256, U256};
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub fn init_for_testing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Address the test logs are emitted from.
pub fn tbtc_system_address() -> EthAddress {
    EthAddress::repeat_byte(0x42)
}

pub fn address_topic(address: EthAddress) -> H256 {
    let mut topic = [0u8; 32];
    topic[12..].copy_from_slice(address.as_bytes());
    H256(topic)
}

fn raw_log(kind: EventKind, indexed: Vec<H256>, data: Vec<Token>, block_number: u64) -> RawEthLog {
    let tx_hash = H256::from_low_u64_be(block_number);
    let mut topics = vec![kind.signature()];
    topics.extend(indexed);
    RawEthLog {
        block_number,
        tx_hash,
        log: Log {
            address: tbtc_system_address(),
            topics,
            data: ethers::abi::encode(&data).into(),
            block_number: Some(block_number.into()),
            transaction_hash: Some(tx_hash),
            ..Default::default()
        },
    }
}

pub fn deposit_created_log(
    deposit: EthAddress,
    keep: EthAddress,
    timestamp: u64,
    block_number: u64,
) -> RawEthLog {
    raw_log(
        EventKind::DepositCreated,
        vec![address_topic(deposit), address_topic(keep)],
        vec![Token::Uint(timestamp.into())],
        block_number,
    )
}

pub fn pubkey_registered_log(
    deposit: EthAddress,
    pubkey_x: [u8; 32],
    pubkey_y: [u8; 32],
    timestamp: u64,
    block_number: u64,
) -> RawEthLog {
    raw_log(
        EventKind::PubkeyRegistered,
        vec![address_topic(deposit)],
        vec![
            Token::FixedBytes(pubkey_x.to_vec()),
            Token::FixedBytes(pubkey_y.to_vec()),
            Token::Uint(timestamp.into()),
        ],
        block_number,
    )
}

pub struct RedemptionRequestedFixture {
    pub deposit: EthAddress,
    pub requester: EthAddress,
    pub digest: [u8; 32],
    pub utxo_value: U256,
    pub redeemer_output_script: Vec<u8>,
    pub requested_fee: U256,
    pub outpoint: Vec<u8>,
    pub block_number: u64,
}

pub fn redemption_requested_log(fixture: &RedemptionRequestedFixture) -> RawEthLog {
    raw_log(
        EventKind::RedemptionRequested,
        vec![
            address_topic(fixture.deposit),
            address_topic(fixture.requester),
            H256(fixture.digest),
        ],
        vec![
            Token::Uint(fixture.utxo_value),
            Token::Bytes(fixture.redeemer_output_script.clone()),
            Token::Uint(fixture.requested_fee),
            Token::Bytes(fixture.outpoint.clone()),
        ],
        fixture.block_number,
    )
}

pub fn redemption_signature_log(
    deposit: EthAddress,
    digest: [u8; 32],
    r: [u8; 32],
    s: [u8; 32],
    timestamp: u64,
    block_number: u64,
) -> RawEthLog {
    raw_log(
        EventKind::RedemptionSignatureProvided,
        vec![address_topic(deposit), H256(digest)],
        vec![
            Token::FixedBytes(r.to_vec()),
            Token::FixedBytes(s.to_vec()),
            Token::Uint(timestamp.into()),
        ],
        block_number,
    )
}

pub fn deposit_redeemed_log(
    deposit: EthAddress,
    txid: [u8; 32],
    timestamp: u64,
    block_number: u64,
) -> RawEthLog {
    raw_log(
        EventKind::DepositRedeemed,
        vec![address_topic(deposit), H256(txid)],
        vec![Token::Uint(timestamp.into())],
        block_number,
    )
}

/// Per-account counters starting at the same value.
pub struct SequentialNonceSource {
    start: u64,
    next: Mutex<HashMap<EthAddress, u64>>,
    fail_next: Mutex<Option<String>>,
}

impl SequentialNonceSource {
    pub fn new(start: u64) -> Self {
        Self {
            start,
            next: Mutex::new(HashMap::new()),
            fail_next: Mutex::new(None),
        }
    }

    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl NonceSource for SequentialNonceSource {
    async fn next_nonce(&self, account: EthAddress) -> anyhow::Result<U256> {
        if let Some(message) = self.fail_next.lock().unwrap().take() {
            return Err(anyhow!(message));
        }
        let mut next = self.next.lock().unwrap();
        let nonce = next.entry(account).or_insert(self.start);
        let allocated = *nonce;
        *nonce += 1;
        Ok(U256::from(allocated))
    }
}

/// Records every send, including the ones it then fails.
#[derive(Default)]
pub struct RecordingSubmitter {
    sent: Mutex<Vec<(EthAddress, TransactionRequest, U256)>>,
    delay: Option<Duration>,
    fail_next: Mutex<Option<String>>,
    blocked: Mutex<HashMap<EthAddress, Arc<Notify>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock().unwrap() = Some(message.to_string());
    }

    /// Sends from `account` hang until the returned notify fires.
    pub fn block_account(&self, account: EthAddress) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.blocked.lock().unwrap().insert(account, notify.clone());
        notify
    }

    pub fn sent_nonces(&self, account: EthAddress) -> Vec<u64> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(from, _, _)| *from == account)
            .map(|(_, _, nonce)| nonce.as_u64())
            .collect()
    }

    pub fn requests(&self) -> Vec<TransactionRequest> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, request, _)| request.clone())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionSubmitter for RecordingSubmitter {
    async fn sign_and_send(
        &self,
        account: EthAddress,
        request: &TransactionRequest,
        nonce: U256,
    ) -> anyhow::Result<TxHash> {
        self.sent
            .lock()
            .unwrap()
            .push((account, request.clone(), nonce));
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let blocked = self.blocked.lock().unwrap().get(&account).cloned();
        if let Some(notify) = blocked {
            notify.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(message) = self.fail_next.lock().unwrap().take() {
            return Err(anyhow!(message));
        }
        let mut preimage = account.as_bytes().to_vec();
        preimage.extend_from_slice(&ethers::abi::encode(&[Token::Uint(nonce)]));
        Ok(H256::from(keccak256(preimage)))
    }
}

/// Answers read-only calls with canned return data, keyed by operation.
#[derive(Default)]
pub struct MockContractReader {
    responses: Mutex<HashMap<&'static str, Bytes>>,
    calls: Mutex<Vec<TransactionRequest>>,
}

impl MockContractReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, operation: &'static str, tokens: &[Token]) {
        self.responses
            .lock()
            .unwrap()
            .insert(operation, ethers::abi::encode(tokens).into());
    }

    pub fn calls(&self) -> Vec<TransactionRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContractReader for MockContractReader {
    async fn call(&self, request: &TransactionRequest) -> anyhow::Result<Bytes> {
        self.calls.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .get(request.operation)
            .cloned()
            .ok_or_else(|| anyhow!("execution reverted: {}", request.operation))
    }
}

pub struct MockMiningWaiter {
    succeeded: bool,
    waits: Mutex<Vec<(TxHash, usize)>>,
}

impl MockMiningWaiter {
    pub fn new(succeeded: bool) -> Self {
        Self {
            succeeded,
            waits: Mutex::new(Vec::new()),
        }
    }

    pub fn waits(&self) -> Vec<(TxHash, usize)> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl MiningWaiter for MockMiningWaiter {
    async fn wait_for_confirmations(
        &self,
        tx_hash: TxHash,
        confirmations: usize,
    ) -> anyhow::Result<bool> {
        self.waits.lock().unwrap().push((tx_hash, confirmations));
        Ok(self.succeeded)
    }
}

/// Hands the test the sending side of every watch it sets up.
#[derive(Default)]
pub struct MockLogFeed {
    setup_error: Option<String>,
    sender: Mutex<Option<mpsc::Sender<FeedUpdate>>>,
    filters: Mutex<Vec<LogFilter>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl MockLogFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            setup_error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn sender(&self) -> mpsc::Sender<FeedUpdate> {
        self.sender
            .lock()
            .unwrap()
            .clone()
            .expect("watch has not been set up")
    }

    pub fn filters(&self) -> Vec<LogFilter> {
        self.filters.lock().unwrap().clone()
    }

    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.cancel.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogFeed for MockLogFeed {
    async fn watch(
        &self,
        filter: LogFilter,
        cancel: CancellationToken,
    ) -> GatewayResult<mpsc::Receiver<FeedUpdate>> {
        if let Some(message) = &self.setup_error {
            return Err(GatewayError::Transport(message.clone()));
        }
        let (tx, rx) = mpsc::channel(100);
        *self.sender.lock().unwrap() = Some(tx);
        self.filters.lock().unwrap().push(filter);
        *self.cancel.lock().unwrap() = Some(cancel);
        Ok(rx)
    }
}
