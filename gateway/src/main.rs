// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use clap::Parser;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use prometheus::Registry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tbtc_gateway::config::GatewayConfig;
use tbtc_gateway::events::{DomainEvent, EventKind};
use tbtc_gateway::log_feed::EthLogFeed;
use tbtc_gateway::metrics::{start_metrics_server, GatewayMetrics};
use tbtc_gateway::transaction::eth::{
    ProviderContractReader, ProviderMiningWaiter, ProviderNonceSource, SignerSubmitter,
};
use tbtc_gateway::transaction::AccountLocks;
use tbtc_gateway::{ChainGateway, ChainResources};
use tbtc_gateway_config::Config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version)]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = GatewayConfig::load(&args.config_path)?;

    let registry = Registry::new();
    let metrics = Arc::new(GatewayMetrics::new(&registry));
    if let Some(port) = config.metrics_port {
        start_metrics_server(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            registry.clone(),
        );
    }

    let provider = Provider::<Http>::try_from(config.eth_rpc_url.as_str())
        .with_context(|| format!("invalid eth-rpc-url {}", config.eth_rpc_url))?;
    let chain_id = provider.get_chainid().await?.as_u64();
    let key = std::fs::read_to_string(&config.account_key_path).with_context(|| {
        format!(
            "failed to read signing key from {}",
            config.account_key_path.display()
        )
    })?;
    let wallet = LocalWallet::from_str(key.trim())
        .context("signing key is not a hex-encoded secp256k1 key")?
        .with_chain_id(chain_id);
    let account = wallet.address();
    let signer = Arc::new(SignerMiddleware::new(provider.clone(), wallet));
    let provider = Arc::new(provider);

    let resources = ChainResources {
        account,
        nonce_source: Arc::new(ProviderNonceSource::new(provider.clone())),
        submitter: Arc::new(SignerSubmitter::new(signer)),
        reader: Arc::new(ProviderContractReader::new(provider.clone())),
        mining_waiter: Arc::new(ProviderMiningWaiter::new(
            provider.clone(),
            config.watch.poll_interval(),
            config.mining_timeout(),
        )),
        account_locks: Arc::new(AccountLocks::new()),
        metrics: metrics.clone(),
    };
    let feed = Arc::new(EthLogFeed::new(provider, config.watch.clone(), metrics)?);

    let cancel = CancellationToken::new();
    let gateway = ChainGateway::from_config(&config, resources, feed, cancel.clone()).await?;
    let subscriptions: Vec<_> = EventKind::iter()
        .map(|kind| {
            gateway.subscribe(kind, log_event, move |e| {
                warn!("[tbtc-gateway] {} subscription saw a feed fault: {}", kind, e)
            })
        })
        .collect();
    info!(
        "[tbtc-gateway] Account {:#x} watching {:#x} (chain id {})",
        gateway.account(),
        gateway.system_contract(),
        chain_id
    );

    tokio::signal::ctrl_c().await?;
    info!("[tbtc-gateway] Shutting down");
    for subscription in subscriptions {
        subscription.cancel();
    }
    gateway.shutdown();
    cancel.cancel();
    Ok(())
}

fn log_event(event: DomainEvent) -> anyhow::Result<()> {
    info!(
        "[tbtc-gateway] {} on deposit {}: {}",
        event.kind(),
        event.deposit_address(),
        serde_json::to_string(&event)?
    );
    Ok(())
}
