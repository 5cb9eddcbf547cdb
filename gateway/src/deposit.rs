// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Calls against individual deposit contract instances.
//!
//! Every operation validates its input before anything leaves the process:
//! a malformed address or a byte argument of the wrong width fails without a
//! network round-trip. Mutating calls go through the [`TransactionGate`];
//! their errors are returned unchanged.

use crate::error::{GatewayError, GatewayResult};
use crate::transaction::{ContractReader, TransactionGate};
use crate::types::{canonical_address, DepositAddress, TransactionHandle, TransactionRequest};
use ethers::abi::{ParamType, Token};
use ethers::types::{Address as EthAddress, U256};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

const RETRIEVE_SIGNER_PUBKEY: &str = "retrieveSignerPubkey()";
const PROVIDE_REDEMPTION_SIGNATURE: &str = "provideRedemptionSignature(uint8,bytes32,bytes32)";
const INCREASE_REDEMPTION_FEE: &str = "increaseRedemptionFee(bytes8,bytes8)";
const KEEP_ADDRESS: &str = "keepAddress()";

/// A resolved deposit contract instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositContract {
    address: DepositAddress,
}

impl DepositContract {
    pub fn address(&self) -> DepositAddress {
        self.address
    }

    fn request(&self, operation: &'static str, args: Vec<Token>) -> TransactionRequest {
        TransactionRequest::new(self.address.as_eth_address(), operation, args)
    }
}

pub struct DepositContractProxy {
    account: EthAddress,
    gate: Arc<TransactionGate>,
    reader: Arc<dyn ContractReader>,
}

impl DepositContractProxy {
    pub fn new(
        account: EthAddress,
        gate: Arc<TransactionGate>,
        reader: Arc<dyn ContractReader>,
    ) -> Self {
        Self {
            account,
            gate,
            reader,
        }
    }

    /// Parses the address into a contract handle. Never touches the network.
    pub fn resolve(&self, deposit_address: &str) -> GatewayResult<DepositContract> {
        let address = DepositAddress::from_str(deposit_address)?;
        Ok(DepositContract { address })
    }

    pub async fn retrieve_signer_pubkey(
        &self,
        deposit_address: &str,
    ) -> GatewayResult<TransactionHandle> {
        let contract = self.resolve(deposit_address)?;
        self.submit(contract.request(RETRIEVE_SIGNER_PUBKEY, vec![]))
            .await
    }

    pub async fn provide_redemption_signature(
        &self,
        deposit_address: &str,
        recovery_id: u8,
        r: &[u8],
        s: &[u8],
    ) -> GatewayResult<TransactionHandle> {
        let contract = self.resolve(deposit_address)?;
        let r: [u8; 32] = fixed_width("r", r)?;
        let s: [u8; 32] = fixed_width("s", s)?;
        self.submit(contract.request(
            PROVIDE_REDEMPTION_SIGNATURE,
            vec![
                Token::Uint(U256::from(recovery_id)),
                Token::FixedBytes(r.to_vec()),
                Token::FixedBytes(s.to_vec()),
            ],
        ))
        .await
    }

    /// Both values are 8-byte satoshi amounts and go on the wire exactly as
    /// given.
    pub async fn increase_redemption_fee(
        &self,
        deposit_address: &str,
        previous_output_value: &[u8],
        new_output_value: &[u8],
    ) -> GatewayResult<TransactionHandle> {
        let contract = self.resolve(deposit_address)?;
        let previous: [u8; 8] = fixed_width("previous output value", previous_output_value)?;
        let new: [u8; 8] = fixed_width("new output value", new_output_value)?;
        self.submit(contract.request(
            INCREASE_REDEMPTION_FEE,
            vec![
                Token::FixedBytes(previous.to_vec()),
                Token::FixedBytes(new.to_vec()),
            ],
        ))
        .await
    }

    /// Address of the signing group (keep) backing the deposit.
    pub async fn keep_address(&self, deposit_address: &str) -> GatewayResult<String> {
        let contract = self.resolve(deposit_address)?;
        let request = contract.request(KEEP_ADDRESS, vec![]);
        let output = self.reader.call(&request).await.map_err(|e| {
            GatewayError::Provider(format!(
                "{} call on deposit {} failed: {:?}",
                request.operation_name(),
                contract.address(),
                e
            ))
        })?;
        match ethers::abi::decode(&[ParamType::Address], &output)
            .map_err(|e| GatewayError::Provider(format!("unexpected keepAddress output: {e}")))?
            .as_slice()
        {
            [Token::Address(keep)] => Ok(canonical_address(keep)),
            other => Err(GatewayError::Provider(format!(
                "unexpected keepAddress output: {other:?}"
            ))),
        }
    }

    async fn submit(&self, request: TransactionRequest) -> GatewayResult<TransactionHandle> {
        debug!(
            "[DepositContractProxy] {} on deposit {:#x}",
            request.operation_name(),
            request.target
        );
        self.gate.submit(self.account, request).await
    }
}

fn fixed_width<const N: usize>(field: &str, value: &[u8]) -> GatewayResult<[u8; N]> {
    <[u8; N]>::try_from(value).map_err(|_| {
        GatewayError::InvalidArgument(format!(
            "{field} must be exactly {N} bytes, got {}",
            value.len()
        ))
    })
}
