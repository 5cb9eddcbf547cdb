// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The watch primitive that feeds raw logs into the gateway.
//!
//! A [`LogFeed`] turns a filter into a stream of [`FeedUpdate`]s. Logs arrive
//! in chain order; faults of the underlying transport arrive on the same
//! stream as [`FeedUpdate::Error`] so the consumer can route them apart from
//! domain events. The stream ends when the cancellation token fires.

use crate::config::WatchConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::GatewayMetrics;
use crate::retry_with_max_elapsed_time;
use crate::types::RawEthLog;
use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::types::{Address as EthAddress, Filter, ValueOrArray, H256};
use std::sync::Arc;
use tap::TapFallible;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum FeedUpdate {
    Log(RawEthLog),
    Error(String),
}

/// Logs emitted by `address` whose first topic is any of `topics`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: EthAddress,
    pub topics: Vec<H256>,
}

#[async_trait]
pub trait LogFeed: Send + Sync {
    /// Starts watching. Fails if the watch cannot be set up; faults after
    /// that are reported on the returned stream.
    async fn watch(
        &self,
        filter: LogFilter,
        cancel: CancellationToken,
    ) -> GatewayResult<mpsc::Receiver<FeedUpdate>>;
}

/// Polls an ethers provider for logs in bounded block ranges.
pub struct EthLogFeed<P> {
    provider: Arc<Provider<P>>,
    config: WatchConfig,
    metrics: Arc<GatewayMetrics>,
}

impl<P> EthLogFeed<P>
where
    P: JsonRpcClient + 'static,
{
    pub fn new(
        provider: Arc<Provider<P>>,
        config: WatchConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> GatewayResult<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            config,
            metrics,
        })
    }
}

#[async_trait]
impl<P> LogFeed for EthLogFeed<P>
where
    P: JsonRpcClient + 'static,
{
    async fn watch(
        &self,
        filter: LogFilter,
        cancel: CancellationToken,
    ) -> GatewayResult<mpsc::Receiver<FeedUpdate>> {
        let head = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| GatewayError::Transport(format!("failed to read head block: {e:?}")))?
            .as_u64();
        let start_block = self.config.start_block.unwrap_or(head);
        info!(
            "[EthLogFeed] Watching {:#x} for {} signatures from block {} (head {})",
            filter.address,
            filter.topics.len(),
            start_block,
            head
        );

        let (tx, rx) = mpsc::channel(self.config.channel_size);
        tokio::spawn(run_poll_task(
            self.provider.clone(),
            self.config.clone(),
            filter,
            start_block,
            tx,
            cancel,
            self.metrics.clone(),
        ));
        Ok(rx)
    }
}

/// Next inclusive block range to fetch, or None when the cursor is ahead of
/// the head.
fn next_range(cursor: u64, head: u64, max_block_range: u64) -> Option<(u64, u64)> {
    if head < cursor {
        return None;
    }
    let end = std::cmp::min(cursor.saturating_add(max_block_range - 1), head);
    Some((cursor, end))
}

async fn run_poll_task<P>(
    provider: Arc<Provider<P>>,
    config: WatchConfig,
    filter: LogFilter,
    mut cursor: u64,
    tx: mpsc::Sender<FeedUpdate>,
    cancel: CancellationToken,
    metrics: Arc<GatewayMetrics>,
) where
    P: JsonRpcClient + 'static,
{
    let mut interval = time::interval(config.poll_interval());
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    let topics = ValueOrArray::Array(filter.topics.iter().copied().map(Some).collect());
    let mut more_blocks = false;

    loop {
        // When catching up, don't wait for the next tick
        if !more_blocks {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
                _ = interval.tick() => {}
            }
        } else if cancel.is_cancelled() || tx.is_closed() {
            break;
        }
        more_blocks = false;

        let head = match retry_with_max_elapsed_time!(
            provider.get_block_number(),
            config.max_retry_duration()
        ) {
            Ok(Ok(head)) => head.as_u64(),
            Ok(Err(e)) | Err(e) => {
                if !report(&tx, format!("failed to read head block: {e:?}")).await {
                    break;
                }
                continue;
            }
        };
        let Some((from, to)) = next_range(cursor, head, config.max_block_range) else {
            debug!("[EthLogFeed] Head {} behind cursor {}, waiting", head, cursor);
            continue;
        };
        more_blocks = to < head;

        let query = Filter::new()
            .address(filter.address)
            .topic0(topics.clone())
            .from_block(from)
            .to_block(to);
        let logs = match retry_with_max_elapsed_time!(
            provider.get_logs(&query),
            config.max_retry_duration()
        ) {
            Ok(Ok(logs)) => logs,
            Ok(Err(e)) | Err(e) => {
                more_blocks = false;
                if !report(&tx, format!("failed to fetch logs in blocks {from}-{to}: {e:?}")).await
                {
                    break;
                }
                continue;
            }
        };

        // Safeguard: everything must come from the watched contract
        if let Some(stray) = logs.iter().find(|log| log.address != filter.address) {
            more_blocks = false;
            let message = format!(
                "provider returned log from {:#x} while watching {:#x}",
                stray.address, filter.address
            );
            if !report(&tx, message).await {
                break;
            }
            continue;
        }
        let raw_logs = match logs
            .into_iter()
            .map(RawEthLog::try_from)
            .collect::<GatewayResult<Vec<_>>>()
            .tap_err(|e| error!("[EthLogFeed] Unusable log in blocks {}-{}: {}", from, to, e))
        {
            Ok(raw_logs) => raw_logs,
            Err(e) => {
                more_blocks = false;
                if !report(&tx, e.to_string()).await {
                    break;
                }
                continue;
            }
        };

        debug!(
            "[EthLogFeed] Fetched {} logs in blocks {}-{}",
            raw_logs.len(),
            from,
            to
        );
        for log in raw_logs {
            if tx.send(FeedUpdate::Log(log)).await.is_err() {
                info!("[EthLogFeed] Receiver dropped, stopping");
                return;
            }
        }
        cursor = to + 1;
        metrics.last_watched_block.set(to as i64);
    }
    info!("[EthLogFeed] Watch of {:#x} stopped", filter.address);
}

// Returns false once nobody is listening anymore.
async fn report(tx: &mpsc::Sender<FeedUpdate>, message: String) -> bool {
    warn!("[EthLogFeed] {}", message);
    tx.send(FeedUpdate::Error(message)).await.is_ok()
}
