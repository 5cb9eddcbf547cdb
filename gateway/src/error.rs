// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::types::H256;

/// Reasons a raw log cannot be mapped to exactly one deposit event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("log carries no event signature topic")]
    MissingSignature,

    #[error("unknown event signature {0:?}")]
    UnknownSignature(H256),

    #[error("{event} expects {expected} indexed topics, log has {actual}")]
    TopicCount {
        event: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{event}.{field} topic is not a 20-byte address")]
    AddressTopicWidth {
        event: &'static str,
        field: &'static str,
    },

    #[error("{event} data is malformed: {reason}")]
    MalformedData { event: &'static str, reason: String },

    #[error("{event}.{field} has width {actual}, expected {expected}")]
    FieldWidth {
        event: &'static str,
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{event} data ({len} bytes) is not canonically encoded")]
    NonCanonicalData { event: &'static str, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    // Missing or malformed contract configuration
    #[error("config error: {0}")]
    Config(String),
    // Caller supplied a syntactically invalid address
    #[error("address error: {0}")]
    Address(String),
    // Operation argument rejected before any network call
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    // Log could not be mapped to a known event
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    // Transaction construction or submission failed
    #[error("submission error: {0}")]
    Submission(String),
    // The log feed reported a fault
    #[error("transport error: {0}")]
    Transport(String),
    // Ethereum provider error outside of submission
    #[error("provider error: {0}")]
    Provider(String),
}

impl GatewayError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config",
            GatewayError::Address(_) => "address",
            GatewayError::InvalidArgument(_) => "invalid_argument",
            GatewayError::Decode(_) => "decode",
            GatewayError::Submission(_) => "submission",
            GatewayError::Transport(_) => "transport",
            GatewayError::Provider(_) => "provider",
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
