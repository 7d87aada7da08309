//! Oracle type definitions.

use alloy::primitives::{address, Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pseudo-address used as the quote asset for USD valuations (ISO 4217 code 840).
pub const USD: Address = address!("0000000000000000000000000000000000000348");

/// WAD constant: 1e18 for 18-decimal fixed-point arithmetic
pub(crate) const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// Length of an encoded pull-oracle payload: base(20) | quote(20) | rate(32).
pub const PULL_PAYLOAD_LEN: usize = 72;

/// Oracle failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("no price feed for {base} -> {quote}")]
    MissingRate { base: Address, quote: Address },

    #[error("zero rate reported for {base} -> {quote}")]
    ZeroRate { base: Address, quote: Address },

    #[error("malformed pull-oracle payload ({len} bytes, expected 72)")]
    MalformedPayload { len: usize },

    #[error("oracle update fee underpaid: required {required}, paid {paid}")]
    UpdateFeeUnderpaid { required: U256, paid: U256 },

    #[error("arithmetic overflow while deriving a rate")]
    Overflow,

    #[error("oracle view does not accept direct updates")]
    ReadOnly,
}

/// A single pull-style price update, as posted by a keeper together with
/// the fee the oracle network charges for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullUpdate {
    /// Encoded update payload
    pub payload: Bytes,
    /// Fee charged for applying this update (native units)
    pub fee: U256,
}

impl PullUpdate {
    /// Encode a rate update for `base -> quote`.
    pub fn encode(base: Address, quote: Address, rate: U256, fee: U256) -> Self {
        let mut buf = Vec::with_capacity(PULL_PAYLOAD_LEN);
        buf.extend_from_slice(base.as_slice());
        buf.extend_from_slice(quote.as_slice());
        buf.extend_from_slice(&rate.to_be_bytes::<32>());
        Self {
            payload: Bytes::from(buf),
            fee,
        }
    }

    /// Decode the payload into `(base, quote, rate)`.
    pub fn decode(&self) -> Result<(Address, Address, U256), OracleError> {
        let raw = self.payload.as_ref();
        if raw.len() != PULL_PAYLOAD_LEN {
            return Err(OracleError::MalformedPayload { len: raw.len() });
        }
        let base = Address::from_slice(&raw[..20]);
        let quote = Address::from_slice(&raw[20..40]);
        let rate = U256::from_be_slice(&raw[40..]);
        Ok((base, quote, rate))
    }
}

/// Oracle data attached to a protocol call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleData {
    /// Pull updates to apply before any pricing happens
    pub updates: Vec<PullUpdate>,
    /// Fee the caller supplied for the updates
    pub fee_paid: U256,
}

impl OracleData {
    /// No updates, no fee.
    pub fn none() -> Self {
        Self::default()
    }

    /// Total fee required by the attached updates.
    pub fn required_fee(&self) -> U256 {
        self.updates.iter().fold(U256::ZERO, |acc, u| acc.saturating_add(u.fee))
    }

    /// Check the supplied fee covers every update.
    pub fn ensure_fee_covered(&self) -> Result<(), OracleError> {
        let required = self.required_fee();
        if self.fee_paid < required {
            return Err(OracleError::UpdateFeeUnderpaid {
                required,
                paid: self.fee_paid,
            });
        }
        Ok(())
    }
}
