// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The public surface used by protocol logic: typed event subscriptions on
//! the TBTCSystem registry and the deposit operations.
//!
//! A gateway is composed from a [`ChainResources`] bundle. Gateways that
//! submit from the same account must be built from bundles sharing one
//! [`AccountLocks`] so their submissions stay ordered.

use crate::config::{GatewayConfig, TBTC_SYSTEM_CONTRACT_NAME};
use crate::deposit::{DepositContract, DepositContractProxy};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{
    DepositCreated, DepositRedeemed, DomainEvent, EventKind, PubkeyRegistered,
    RedemptionRequested, RedemptionSignatureProvided,
};
use crate::log_feed::{FeedUpdate, LogFeed, LogFilter};
use crate::metrics::GatewayMetrics;
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::transaction::{
    AccountLocks, ContractReader, MiningWaiter, NonceSource, TransactionGate, TransactionSubmitter,
};
use crate::types::{parse_hex_address, TransactionHandle};
use anyhow::anyhow;
use ethers::types::Address as EthAddress;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_REQUIRED_CONFIRMATIONS: usize = 12;

/// Everything a gateway borrows from its environment.
#[derive(Clone)]
pub struct ChainResources {
    /// Account that signs and pays for submissions
    pub account: EthAddress,
    pub nonce_source: Arc<dyn NonceSource>,
    pub submitter: Arc<dyn TransactionSubmitter>,
    pub reader: Arc<dyn ContractReader>,
    pub mining_waiter: Arc<dyn MiningWaiter>,
    pub account_locks: Arc<AccountLocks>,
    pub metrics: Arc<GatewayMetrics>,
}

pub struct ChainGateway {
    resources: ChainResources,
    system_contract: EthAddress,
    registry: SubscriptionRegistry,
    proxy: DepositContractProxy,
    required_confirmations: usize,
    cancel: CancellationToken,
}

impl ChainGateway {
    /// Starts watching the registry contract at `system_contract_address`.
    /// Fails if the address is malformed or the watch cannot be set up.
    pub async fn new(
        resources: ChainResources,
        system_contract_address: &str,
        feed: Arc<dyn LogFeed>,
        cancel: CancellationToken,
    ) -> GatewayResult<Self> {
        let system_contract = parse_hex_address(system_contract_address).ok_or_else(|| {
            GatewayError::Config(format!(
                "configured address [{system_contract_address}] for contract [{TBTC_SYSTEM_CONTRACT_NAME}] is not valid hex address"
            ))
        })?;
        Self::start(resources, system_contract, feed, cancel).await
    }

    pub async fn from_config(
        config: &GatewayConfig,
        resources: ChainResources,
        feed: Arc<dyn LogFeed>,
        cancel: CancellationToken,
    ) -> GatewayResult<Self> {
        let system_contract = config.contract_address(TBTC_SYSTEM_CONTRACT_NAME)?;
        Ok(Self::start(resources, system_contract, feed, cancel)
            .await?
            .with_required_confirmations(config.required_confirmations))
    }

    async fn start(
        resources: ChainResources,
        system_contract: EthAddress,
        feed: Arc<dyn LogFeed>,
        cancel: CancellationToken,
    ) -> GatewayResult<Self> {
        let registry = SubscriptionRegistry::new(resources.metrics.clone());
        let cancel = cancel.child_token();
        let updates = feed
            .watch(
                LogFilter {
                    address: system_contract,
                    topics: EventKind::all_signatures(),
                },
                cancel.clone(),
            )
            .await?;
        tokio::spawn(run_dispatch_task(registry.clone(), updates, cancel.clone()));

        let gate = Arc::new(TransactionGate::new(
            resources.nonce_source.clone(),
            resources.submitter.clone(),
            resources.account_locks.clone(),
            resources.metrics.clone(),
        ));
        let proxy = DepositContractProxy::new(resources.account, gate, resources.reader.clone());
        info!(
            "[ChainGateway] Started for account {:#x} on registry {:#x}",
            resources.account, system_contract
        );
        Ok(Self {
            resources,
            system_contract,
            registry,
            proxy,
            required_confirmations: DEFAULT_REQUIRED_CONFIRMATIONS,
            cancel,
        })
    }

    pub fn with_required_confirmations(mut self, confirmations: usize) -> Self {
        self.required_confirmations = confirmations;
        self
    }

    pub fn account(&self) -> EthAddress {
        self.resources.account
    }

    pub fn system_contract(&self) -> EthAddress {
        self.system_contract
    }

    /// Untyped subscription; the handler receives whole [`DomainEvent`]s.
    pub fn subscribe<H, E>(&self, kind: EventKind, handler: H, on_error: E) -> Subscription
    where
        H: Fn(DomainEvent) -> anyhow::Result<()> + Send + Sync + 'static,
        E: Fn(GatewayError) + Send + Sync + 'static,
    {
        self.registry.subscribe(kind, handler, on_error)
    }

    pub fn on_deposit_created<H, E>(&self, handler: H, on_error: E) -> Subscription
    where
        H: Fn(DepositCreated) -> anyhow::Result<()> + Send + Sync + 'static,
        E: Fn(GatewayError) + Send + Sync + 'static,
    {
        self.subscribe_typed(EventKind::DepositCreated, handler, on_error)
    }

    pub fn on_pubkey_registered<H, E>(&self, handler: H, on_error: E) -> Subscription
    where
        H: Fn(PubkeyRegistered) -> anyhow::Result<()> + Send + Sync + 'static,
        E: Fn(GatewayError) + Send + Sync + 'static,
    {
        self.subscribe_typed(EventKind::PubkeyRegistered, handler, on_error)
    }

    pub fn on_redemption_requested<H, E>(&self, handler: H, on_error: E) -> Subscription
    where
        H: Fn(RedemptionRequested) -> anyhow::Result<()> + Send + Sync + 'static,
        E: Fn(GatewayError) + Send + Sync + 'static,
    {
        self.subscribe_typed(EventKind::RedemptionRequested, handler, on_error)
    }

    pub fn on_redemption_signature_provided<H, E>(&self, handler: H, on_error: E) -> Subscription
    where
        H: Fn(RedemptionSignatureProvided) -> anyhow::Result<()> + Send + Sync + 'static,
        E: Fn(GatewayError) + Send + Sync + 'static,
    {
        self.subscribe_typed(EventKind::RedemptionSignatureProvided, handler, on_error)
    }

    pub fn on_deposit_redeemed<H, E>(&self, handler: H, on_error: E) -> Subscription
    where
        H: Fn(DepositRedeemed) -> anyhow::Result<()> + Send + Sync + 'static,
        E: Fn(GatewayError) + Send + Sync + 'static,
    {
        self.subscribe_typed(EventKind::DepositRedeemed, handler, on_error)
    }

    fn subscribe_typed<T, H, E>(&self, kind: EventKind, handler: H, on_error: E) -> Subscription
    where
        T: TryFrom<DomainEvent, Error = DomainEvent> + 'static,
        H: Fn(T) -> anyhow::Result<()> + Send + Sync + 'static,
        E: Fn(GatewayError) + Send + Sync + 'static,
    {
        self.registry.subscribe(
            kind,
            move |event| match T::try_from(event) {
                Ok(payload) => handler(payload),
                Err(other) => Err(anyhow!(
                    "{} delivered to a {} subscription",
                    other.kind(),
                    kind
                )),
            },
            on_error,
        )
    }

    pub fn subscription_count(&self, kind: EventKind) -> usize {
        self.registry.subscription_count(kind)
    }

    pub fn resolve_deposit(&self, deposit_address: &str) -> GatewayResult<DepositContract> {
        self.proxy.resolve(deposit_address)
    }

    pub async fn retrieve_signer_pubkey(
        &self,
        deposit_address: &str,
    ) -> GatewayResult<TransactionHandle> {
        self.proxy.retrieve_signer_pubkey(deposit_address).await
    }

    pub async fn provide_redemption_signature(
        &self,
        deposit_address: &str,
        recovery_id: u8,
        r: &[u8],
        s: &[u8],
    ) -> GatewayResult<TransactionHandle> {
        self.proxy
            .provide_redemption_signature(deposit_address, recovery_id, r, s)
            .await
    }

    pub async fn increase_redemption_fee(
        &self,
        deposit_address: &str,
        previous_output_value: &[u8],
        new_output_value: &[u8],
    ) -> GatewayResult<TransactionHandle> {
        self.proxy
            .increase_redemption_fee(deposit_address, previous_output_value, new_output_value)
            .await
    }

    pub async fn keep_address(&self, deposit_address: &str) -> GatewayResult<String> {
        self.proxy.keep_address(deposit_address).await
    }

    /// Waits for the configured number of confirmations. Returns whether the
    /// transaction succeeded.
    pub async fn wait_for_confirmation(&self, handle: &TransactionHandle) -> GatewayResult<bool> {
        self.resources
            .mining_waiter
            .wait_for_confirmations(handle.tx_hash, self.required_confirmations)
            .await
            .map_err(|e| {
                GatewayError::Provider(format!(
                    "failed waiting for {} transaction {}: {:?}",
                    handle.operation, handle, e
                ))
            })
    }

    /// Stops the watch. Subscriptions stay registered but see no more events.
    pub fn shutdown(&self) {
        info!("[ChainGateway] Shutting down watch of {:#x}", self.system_contract);
        self.cancel.cancel();
    }
}

// The watch and dispatch tasks live no longer than the gateway.
impl Drop for ChainGateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_dispatch_task(
    registry: SubscriptionRegistry,
    mut updates: mpsc::Receiver<FeedUpdate>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            update = updates.recv() => {
                match update {
                    Some(FeedUpdate::Log(log)) => {
                        registry.deliver_log(&log);
                    }
                    Some(FeedUpdate::Error(message)) => {
                        registry.deliver_error(GatewayError::Transport(message));
                    }
                    None => {
                        warn!("[ChainGateway] Log feed closed");
                        break;
                    }
                }
            }
        }
    }
    info!("[ChainGateway] Event dispatch stopped");
}
