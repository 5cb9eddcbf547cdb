// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{GatewayError, GatewayResult};
use crate::types::parse_hex_address;
use ethers::types::Address as EthAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tbtc_gateway_config::Config;

/// Registry contract whose logs carry every deposit lifecycle event.
pub const TBTC_SYSTEM_CONTRACT_NAME: &str = "TBTCSystem";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct GatewayConfig {
    pub eth_rpc_url: String,
    /// Logical contract name -> hex address
    #[serde(default)]
    pub contract_addresses: BTreeMap<String, String>,
    /// File holding the hex-encoded signing key
    pub account_key_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: usize,
    #[serde(default = "default_mining_timeout_secs")]
    pub mining_timeout_secs: u64,
    #[serde(default)]
    pub watch: WatchConfig,
}

fn default_required_confirmations() -> usize {
    12
}

fn default_mining_timeout_secs() -> u64 {
    600
}

impl Config for GatewayConfig {}

impl GatewayConfig {
    /// Looks up a contract by logical name and validates its address.
    pub fn contract_address(&self, name: &str) -> GatewayResult<EthAddress> {
        let configured = self.contract_addresses.get(name).ok_or_else(|| {
            GatewayError::Config(format!("configuration for contract [{name}] not found"))
        })?;
        parse_hex_address(configured).ok_or_else(|| {
            GatewayError::Config(format!(
                "configured address [{configured}] for contract [{name}] is not valid hex address"
            ))
        })
    }

    pub fn mining_timeout(&self) -> Duration {
        Duration::from_secs(self.mining_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct WatchConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde(default = "default_max_retry_duration_secs")]
    pub max_retry_duration_secs: u64,
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
    /// Defaults to the head block at watch time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_max_retry_duration_secs() -> u64 {
    30
}

fn default_channel_size() -> usize {
    1000
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_block_range: default_max_block_range(),
            max_retry_duration_secs: default_max_retry_duration_secs(),
            channel_size: default_channel_size(),
            start_block: None,
        }
    }
}

impl WatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_retry_duration(&self) -> Duration {
        Duration::from_secs(self.max_retry_duration_secs)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.max_block_range == 0 {
            return Err(GatewayError::Config(
                "watch.max-block-range must be positive".to_string(),
            ));
        }
        if self.channel_size == 0 {
            return Err(GatewayError::Config(
                "watch.channel-size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
