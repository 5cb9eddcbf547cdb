// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{GatewayError, GatewayResult};
use ethers::abi::Token;
use ethers::types::{Address as EthAddress, Bytes, Log, TxHash, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Renders an address as `0x` followed by 40 lower-case hex digits.
pub fn canonical_address(address: &EthAddress) -> String {
    format!("{:#x}", address)
}

/// Parses `0x`/`0X`-prefixed or bare 40 hex digit addresses. Anything else is
/// rejected without guessing, including short or over-long input.
pub fn parse_hex_address(input: &str) -> Option<EthAddress> {
    let hex = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    EthAddress::from_str(hex).ok()
}

/// Address of a deposit's own contract instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepositAddress(EthAddress);

impl DepositAddress {
    pub fn new(address: EthAddress) -> Self {
        Self(address)
    }

    pub fn as_eth_address(&self) -> EthAddress {
        self.0
    }
}

impl FromStr for DepositAddress {
    type Err = GatewayError;

    fn from_str(s: &str) -> GatewayResult<Self> {
        parse_hex_address(s)
            .map(Self)
            .ok_or_else(|| GatewayError::Address(format!("incorrect deposit contract address [{s}]")))
    }
}

impl fmt::Display for DepositAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", canonical_address(&self.0))
    }
}

impl From<EthAddress> for DepositAddress {
    fn from(address: EthAddress) -> Self {
        Self(address)
    }
}

// A log as delivered by the feed, with the nullable fields of `Log`
// already checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEthLog {
    pub block_number: u64,
    pub tx_hash: H256,
    pub log: Log,
}

impl TryFrom<Log> for RawEthLog {
    type Error = GatewayError;

    fn try_from(log: Log) -> GatewayResult<Self> {
        let block_number = log
            .block_number
            .ok_or_else(|| {
                GatewayError::Provider("Provider returns log without block_number".into())
            })?
            .as_u64();
        let tx_hash = log.transaction_hash.ok_or_else(|| {
            GatewayError::Provider("Provider returns log without transaction_hash".into())
        })?;
        Ok(Self {
            block_number,
            tx_hash,
            log,
        })
    }
}

/// A single contract call destined for submission. Built per call.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRequest {
    pub target: EthAddress,
    /// Full function signature, e.g. `retrieveSignerPubkey()`.
    pub operation: &'static str,
    pub args: Vec<Token>,
}

impl TransactionRequest {
    pub fn new(target: EthAddress, operation: &'static str, args: Vec<Token>) -> Self {
        Self {
            target,
            operation,
            args,
        }
    }

    pub fn operation_name(&self) -> &'static str {
        self.operation
            .split('(')
            .next()
            .unwrap_or(self.operation)
    }

    /// Function selector followed by the ABI-encoded arguments.
    pub fn calldata(&self) -> Bytes {
        let mut data = ethers::utils::id(self.operation).to_vec();
        data.extend(ethers::abi::encode(&self.args));
        data.into()
    }
}

/// Result of a successful submission. Confirmation is tracked elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionHandle {
    pub tx_hash: TxHash,
    pub nonce: U256,
    pub account: EthAddress,
    pub target: EthAddress,
    pub operation: &'static str,
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.tx_hash)
    }
}
