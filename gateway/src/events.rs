// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Deposit lifecycle events emitted by the TBTCSystem contract, and the
//! decoder that turns raw logs into them.
//!
//! Every log is mapped to exactly one [`DomainEvent`] variant or rejected
//! with a [`DecodeError`]. Decoding is strict: the signature topic selects
//! the layout, the indexed topic count must match it, address topics must be
//! zero-padded 20-byte values, and the data section must be the canonical
//! ABI encoding of the remaining parameters. Byte fields are handed through
//! unmodified.

use crate::error::DecodeError;
use crate::types::{canonical_address, DepositAddress, RawEthLog};
use ethers::abi::{ParamType, Token};
use ethers::types::{Address as EthAddress, H256, U256};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize,
)]
pub enum EventKind {
    #[strum(serialize = "deposit_created")]
    DepositCreated,
    #[strum(serialize = "pubkey_registered")]
    PubkeyRegistered,
    #[strum(serialize = "redemption_requested")]
    RedemptionRequested,
    #[strum(serialize = "redemption_signature_provided")]
    RedemptionSignatureProvided,
    #[strum(serialize = "deposit_redeemed")]
    DepositRedeemed,
}

static KINDS_BY_SIGNATURE: Lazy<HashMap<H256, EventKind>> =
    Lazy::new(|| EventKind::iter().map(|kind| (kind.signature(), kind)).collect());

impl EventKind {
    /// Solidity event declaration the kind is decoded from.
    pub fn abi_signature(&self) -> &'static str {
        match self {
            EventKind::DepositCreated => "Created(address,address,uint256)",
            EventKind::PubkeyRegistered => "RegisteredPubkey(address,bytes32,bytes32,uint256)",
            EventKind::RedemptionRequested => {
                "RedemptionRequested(address,address,bytes32,uint256,bytes,uint256,bytes)"
            }
            EventKind::RedemptionSignatureProvided => {
                "GotRedemptionSignature(address,bytes32,bytes32,bytes32,uint256)"
            }
            EventKind::DepositRedeemed => "Redeemed(address,bytes32,uint256)",
        }
    }

    /// Keccak hash of the declaration, found in the first topic of the log.
    pub fn signature(&self) -> H256 {
        H256::from(keccak256(self.abi_signature()))
    }

    pub fn from_signature(topic: &H256) -> Option<Self> {
        KINDS_BY_SIGNATURE.get(topic).copied()
    }

    pub fn all_signatures() -> Vec<H256> {
        EventKind::iter().map(|kind| kind.signature()).collect()
    }

    fn event_name(&self) -> &'static str {
        match self {
            EventKind::DepositCreated => "Created",
            EventKind::PubkeyRegistered => "RegisteredPubkey",
            EventKind::RedemptionRequested => "RedemptionRequested",
            EventKind::RedemptionSignatureProvided => "GotRedemptionSignature",
            EventKind::DepositRedeemed => "Redeemed",
        }
    }

    fn indexed_topics(&self) -> usize {
        match self {
            EventKind::DepositCreated => 2,
            EventKind::PubkeyRegistered => 1,
            EventKind::RedemptionRequested => 3,
            EventKind::RedemptionSignatureProvided => 2,
            EventKind::DepositRedeemed => 2,
        }
    }

    fn data_params(&self) -> Vec<ParamType> {
        match self {
            EventKind::DepositCreated | EventKind::DepositRedeemed => vec![ParamType::Uint(256)],
            EventKind::PubkeyRegistered | EventKind::RedemptionSignatureProvided => vec![
                ParamType::FixedBytes(32),
                ParamType::FixedBytes(32),
                ParamType::Uint(256),
            ],
            EventKind::RedemptionRequested => vec![
                ParamType::Uint(256),
                ParamType::Bytes,
                ParamType::Uint(256),
                ParamType::Bytes,
            ],
        }
    }
}

// `Created` emitted by the TBTCSystem deposit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepositCreated {
    pub deposit_address: DepositAddress,
    pub keep_address: String,
    pub timestamp: U256,
}

// `RegisteredPubkey`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PubkeyRegistered {
    pub deposit_address: DepositAddress,
    pub signing_group_pubkey_x: [u8; 32],
    pub signing_group_pubkey_y: [u8; 32],
    pub timestamp: U256,
}

// `RedemptionRequested`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedemptionRequested {
    pub deposit_address: DepositAddress,
    pub requester_address: String,
    pub digest: [u8; 32],
    pub utxo_value: U256,
    pub redeemer_output_script: Vec<u8>,
    pub requested_fee: U256,
    pub outpoint: Vec<u8>,
    pub block_number: u64,
}

// `GotRedemptionSignature`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedemptionSignatureProvided {
    pub deposit_address: DepositAddress,
    pub digest: [u8; 32],
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub timestamp: U256,
}

// `Redeemed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepositRedeemed {
    pub deposit_address: DepositAddress,
    pub txid: [u8; 32],
    pub timestamp: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DomainEvent {
    DepositCreated(DepositCreated),
    PubkeyRegistered(PubkeyRegistered),
    RedemptionRequested(RedemptionRequested),
    RedemptionSignatureProvided(RedemptionSignatureProvided),
    DepositRedeemed(DepositRedeemed),
}

macro_rules! domain_event_payload {
    ($variant:ident) => {
        impl From<$variant> for DomainEvent {
            fn from(event: $variant) -> Self {
                DomainEvent::$variant(event)
            }
        }

        // Hands the event back when it is a different variant
        impl TryFrom<DomainEvent> for $variant {
            type Error = DomainEvent;

            fn try_from(event: DomainEvent) -> Result<Self, DomainEvent> {
                match event {
                    DomainEvent::$variant(event) => Ok(event),
                    other => Err(other),
                }
            }
        }
    };
}

domain_event_payload!(DepositCreated);
domain_event_payload!(PubkeyRegistered);
domain_event_payload!(RedemptionRequested);
domain_event_payload!(RedemptionSignatureProvided);
domain_event_payload!(DepositRedeemed);

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::DepositCreated(_) => EventKind::DepositCreated,
            DomainEvent::PubkeyRegistered(_) => EventKind::PubkeyRegistered,
            DomainEvent::RedemptionRequested(_) => EventKind::RedemptionRequested,
            DomainEvent::RedemptionSignatureProvided(_) => EventKind::RedemptionSignatureProvided,
            DomainEvent::DepositRedeemed(_) => EventKind::DepositRedeemed,
        }
    }

    pub fn deposit_address(&self) -> DepositAddress {
        match self {
            DomainEvent::DepositCreated(e) => e.deposit_address,
            DomainEvent::PubkeyRegistered(e) => e.deposit_address,
            DomainEvent::RedemptionRequested(e) => e.deposit_address,
            DomainEvent::RedemptionSignatureProvided(e) => e.deposit_address,
            DomainEvent::DepositRedeemed(e) => e.deposit_address,
        }
    }

    /// Decodes a raw log into the single event its signature names.
    pub fn try_from_eth_log(log: &RawEthLog) -> Result<Self, DecodeError> {
        let topics = &log.log.topics;
        let signature = topics.first().ok_or(DecodeError::MissingSignature)?;
        let kind =
            EventKind::from_signature(signature).ok_or(DecodeError::UnknownSignature(*signature))?;
        let event = kind.event_name();

        let indexed = &topics[1..];
        if indexed.len() != kind.indexed_topics() {
            return Err(DecodeError::TopicCount {
                event,
                expected: kind.indexed_topics(),
                actual: indexed.len(),
            });
        }
        let deposit_address =
            DepositAddress::new(address_topic(event, "_depositContractAddress", &indexed[0])?);

        let mut fields = FieldReader::decode(event, &kind.data_params(), &log.log.data)?;
        let decoded = match kind {
            EventKind::DepositCreated => DomainEvent::DepositCreated(DepositCreated {
                deposit_address,
                keep_address: canonical_address(&address_topic(
                    event,
                    "_keepAddress",
                    &indexed[1],
                )?),
                timestamp: fields.uint("_timestamp")?,
            }),
            EventKind::PubkeyRegistered => DomainEvent::PubkeyRegistered(PubkeyRegistered {
                deposit_address,
                signing_group_pubkey_x: fields.bytes32("_signingGroupPubkeyX")?,
                signing_group_pubkey_y: fields.bytes32("_signingGroupPubkeyY")?,
                timestamp: fields.uint("_timestamp")?,
            }),
            EventKind::RedemptionRequested => {
                DomainEvent::RedemptionRequested(RedemptionRequested {
                    deposit_address,
                    requester_address: canonical_address(&address_topic(
                        event,
                        "_requester",
                        &indexed[1],
                    )?),
                    digest: indexed[2].to_fixed_bytes(),
                    utxo_value: fields.uint("_utxoValue")?,
                    redeemer_output_script: fields.bytes("_redeemerOutputScript")?,
                    requested_fee: fields.uint("_requestedFee")?,
                    outpoint: fields.bytes("_outpoint")?,
                    block_number: log.block_number,
                })
            }
            EventKind::RedemptionSignatureProvided => {
                DomainEvent::RedemptionSignatureProvided(RedemptionSignatureProvided {
                    deposit_address,
                    digest: indexed[1].to_fixed_bytes(),
                    r: fields.bytes32("_r")?,
                    s: fields.bytes32("_s")?,
                    timestamp: fields.uint("_timestamp")?,
                })
            }
            EventKind::DepositRedeemed => DomainEvent::DepositRedeemed(DepositRedeemed {
                deposit_address,
                txid: indexed[1].to_fixed_bytes(),
                timestamp: fields.uint("_timestamp")?,
            }),
        };
        Ok(decoded)
    }
}

// An indexed address occupies the low 20 bytes of its topic; anything in
// the high 12 bytes means the topic is not an address.
fn address_topic(
    event: &'static str,
    field: &'static str,
    topic: &H256,
) -> Result<EthAddress, DecodeError> {
    let bytes = topic.as_bytes();
    if bytes[..12].iter().any(|b| *b != 0) {
        return Err(DecodeError::AddressTopicWidth { event, field });
    }
    Ok(EthAddress::from_slice(&bytes[12..]))
}

struct FieldReader {
    event: &'static str,
    tokens: std::vec::IntoIter<Token>,
}

impl FieldReader {
    fn decode(event: &'static str, params: &[ParamType], data: &[u8]) -> Result<Self, DecodeError> {
        let tokens = ethers::abi::decode(params, data).map_err(|e| DecodeError::MalformedData {
            event,
            reason: e.to_string(),
        })?;
        // Trailing bytes or odd offsets would decode too; reject them
        if ethers::abi::encode(&tokens) != data {
            return Err(DecodeError::NonCanonicalData {
                event,
                len: data.len(),
            });
        }
        Ok(Self {
            event,
            tokens: tokens.into_iter(),
        })
    }

    fn next(&mut self, field: &'static str) -> Result<Token, DecodeError> {
        self.tokens.next().ok_or_else(|| DecodeError::MalformedData {
            event: self.event,
            reason: format!("missing field {field}"),
        })
    }

    fn uint(&mut self, field: &'static str) -> Result<U256, DecodeError> {
        match self.next(field)? {
            Token::Uint(value) => Ok(value),
            other => Err(self.unexpected(field, &other)),
        }
    }

    fn bytes32(&mut self, field: &'static str) -> Result<[u8; 32], DecodeError> {
        match self.next(field)? {
            Token::FixedBytes(value) => {
                <[u8; 32]>::try_from(value.as_slice()).map_err(|_| DecodeError::FieldWidth {
                    event: self.event,
                    field,
                    expected: 32,
                    actual: value.len(),
                })
            }
            other => Err(self.unexpected(field, &other)),
        }
    }

    fn bytes(&mut self, field: &'static str) -> Result<Vec<u8>, DecodeError> {
        match self.next(field)? {
            Token::Bytes(value) => Ok(value),
            other => Err(self.unexpected(field, &other)),
        }
    }

    fn unexpected(&self, field: &'static str, token: &Token) -> DecodeError {
        DecodeError::MalformedData {
            event: self.event,
            reason: format!("unexpected token for {field}: {token:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        address_topic as to_topic, deposit_created_log, deposit_redeemed_log,
        pubkey_registered_log, redemption_requested_log, redemption_signature_log,
        RedemptionRequestedFixture,
    };

    #[test]
    fn test_signatures_are_distinct_and_known() {
        let signatures = EventKind::all_signatures();
        assert_eq!(signatures.len(), 5);
        for kind in EventKind::iter() {
            assert_eq!(EventKind::from_signature(&kind.signature()), Some(kind));
        }
        assert_eq!(
            EventKind::DepositCreated.signature(),
            H256::from(keccak256("Created(address,address,uint256)"))
        );
        assert_eq!(EventKind::from_signature(&H256::zero()), None);
    }

    #[test]
    fn test_decode_deposit_created_renders_lower_case() {
        let deposit: EthAddress = "0xAbC0000000000000000000000000000000000123".parse().unwrap();
        let keep = EthAddress::repeat_byte(0xEE);
        let log = deposit_created_log(deposit, keep, 1_600_000_000, 100);

        let event = DomainEvent::try_from_eth_log(&log).unwrap();
        assert_eq!(event.kind(), EventKind::DepositCreated);
        let created = DepositCreated::try_from(event).unwrap();
        assert_eq!(
            created.deposit_address.to_string(),
            "0xabc0000000000000000000000000000000000123"
        );
        assert_eq!(created.keep_address, format!("0x{}", "ee".repeat(20)));
        assert_eq!(created.timestamp, U256::from(1_600_000_000u64));
    }

    #[test]
    fn test_decode_pubkey_registered() {
        let deposit = EthAddress::repeat_byte(1);
        let log = pubkey_registered_log(deposit, [0x11; 32], [0x22; 32], 5, 10);

        match DomainEvent::try_from_eth_log(&log).unwrap() {
            DomainEvent::PubkeyRegistered(event) => {
                assert_eq!(event.deposit_address.as_eth_address(), deposit);
                assert_eq!(event.signing_group_pubkey_x, [0x11; 32]);
                assert_eq!(event.signing_group_pubkey_y, [0x22; 32]);
                assert_eq!(event.timestamp, U256::from(5));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_redemption_requested_passes_bytes_through() {
        let fixture = RedemptionRequestedFixture {
            deposit: EthAddress::repeat_byte(3),
            requester: EthAddress::repeat_byte(4),
            digest: [0xAB; 32],
            utxo_value: U256::from(100_000u64),
            // odd lengths to catch padding leaks
            redeemer_output_script: vec![0x16, 0x00, 0x14, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
            requested_fee: U256::from(150u64),
            outpoint: (0u8..36).collect(),
            block_number: 4242,
        };
        let log = redemption_requested_log(&fixture);

        let event = RedemptionRequested::try_from(DomainEvent::try_from_eth_log(&log).unwrap())
            .unwrap();
        assert_eq!(event.deposit_address.as_eth_address(), fixture.deposit);
        assert_eq!(event.requester_address, format!("0x{}", "04".repeat(20)));
        assert_eq!(event.digest, fixture.digest);
        assert_eq!(event.utxo_value, fixture.utxo_value);
        assert_eq!(event.redeemer_output_script, fixture.redeemer_output_script);
        assert_eq!(event.requested_fee, fixture.requested_fee);
        assert_eq!(event.outpoint, fixture.outpoint);
        assert_eq!(event.block_number, 4242);
    }

    #[test]
    fn test_decode_signature_and_redeemed() {
        let deposit = EthAddress::repeat_byte(9);
        let log = redemption_signature_log(deposit, [1; 32], [2; 32], [3; 32], 77, 1);
        let event = RedemptionSignatureProvided::try_from(
            DomainEvent::try_from_eth_log(&log).unwrap(),
        )
        .unwrap();
        assert_eq!(event.digest, [1; 32]);
        assert_eq!(event.r, [2; 32]);
        assert_eq!(event.s, [3; 32]);

        let log = deposit_redeemed_log(deposit, [7; 32], 78, 2);
        let event = DomainEvent::try_from_eth_log(&log).unwrap();
        assert_eq!(event.kind(), EventKind::DepositRedeemed);
        assert_eq!(event.deposit_address().as_eth_address(), deposit);
        let redeemed = DepositRedeemed::try_from(event).unwrap();
        assert_eq!(redeemed.txid, [7; 32]);
    }

    #[test]
    fn test_try_from_wrong_variant_returns_event() {
        let log = deposit_redeemed_log(EthAddress::repeat_byte(9), [7; 32], 78, 2);
        let event = DomainEvent::try_from_eth_log(&log).unwrap();
        let returned = DepositCreated::try_from(event.clone()).unwrap_err();
        assert_eq!(returned, event);
    }

    #[test]
    fn test_decode_rejects_unknown_or_missing_signature() {
        let mut log = deposit_created_log(EthAddress::repeat_byte(1), EthAddress::zero(), 1, 1);
        log.log.topics[0] = H256::repeat_byte(0x42);
        assert_eq!(
            DomainEvent::try_from_eth_log(&log).unwrap_err(),
            DecodeError::UnknownSignature(H256::repeat_byte(0x42))
        );

        log.log.topics.clear();
        assert_eq!(
            DomainEvent::try_from_eth_log(&log).unwrap_err(),
            DecodeError::MissingSignature
        );
    }

    #[test]
    fn test_decode_rejects_wrong_topic_count() {
        let mut log = deposit_created_log(EthAddress::repeat_byte(1), EthAddress::zero(), 1, 1);
        log.log.topics.pop();
        assert_eq!(
            DomainEvent::try_from_eth_log(&log).unwrap_err(),
            DecodeError::TopicCount {
                event: "Created",
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_decode_rejects_wide_address_topic() {
        let mut log = deposit_created_log(EthAddress::repeat_byte(1), EthAddress::zero(), 1, 1);
        let mut topic = to_topic(EthAddress::repeat_byte(1));
        topic.0[0] = 1;
        log.log.topics[1] = topic;
        assert_eq!(
            DomainEvent::try_from_eth_log(&log).unwrap_err(),
            DecodeError::AddressTopicWidth {
                event: "Created",
                field: "_depositContractAddress"
            }
        );
    }

    #[test]
    fn test_decode_rejects_truncated_or_padded_data() {
        let log = pubkey_registered_log(EthAddress::repeat_byte(1), [1; 32], [2; 32], 5, 10);

        let mut truncated = log.clone();
        truncated.log.data = log.log.data[..80].to_vec().into();
        assert!(matches!(
            DomainEvent::try_from_eth_log(&truncated).unwrap_err(),
            DecodeError::MalformedData { event: "RegisteredPubkey", .. }
        ));

        let mut padded = log.clone();
        let mut data = log.log.data.to_vec();
        data.extend_from_slice(&[0u8; 32]);
        padded.log.data = data.into();
        assert_eq!(
            DomainEvent::try_from_eth_log(&padded).unwrap_err(),
            DecodeError::NonCanonicalData {
                event: "RegisteredPubkey",
                len: 128
            }
        );
    }
}
