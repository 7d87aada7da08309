//! Protocol fee computation.

use alloy::primitives::{Address, U256};
use margin_chain::{PriceOracle, USD};
use serde::{Deserialize, Serialize};

use crate::config::FeeConfig;
use crate::error::{MarginError, MarginResult};
use crate::u256_math::{self, Rounding};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeeRateType {
    MarginPositionClosedByTrader,
    SpotPositionClosedByTrader,
    MarginPositionClosedByKeeper,
    SpotPositionClosedByKeeper,
}

impl FeeRateType {
    pub fn for_close(is_margin: bool, by_keeper: bool) -> Self {
        match (is_margin, by_keeper) {
            (true, false) => Self::MarginPositionClosedByTrader,
            (false, false) => Self::SpotPositionClosedByTrader,
            (true, true) => Self::MarginPositionClosedByKeeper,
            (false, true) => Self::SpotPositionClosedByKeeper,
        }
    }
}

/// How a fee is paid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeSplit {
    pub in_payment_asset: U256,
    pub in_discount_token: U256,
}

/// Convert a WAD USD amount to `asset` through the oracle.
pub fn usd_to_asset(oracle: &dyn PriceOracle, usd: U256, asset: Address) -> MarginResult<U256> {
    if usd.is_zero() {
        return Ok(U256::ZERO);
    }
    let rate = oracle.rate(USD, asset)?;
    Ok(u256_math::wad_mul(usd, rate, Rounding::Down)?)
}

/// Fee on `notional` of `payment_asset`, after the tier discount and the
/// USD min/max clamp. Fails when the minimum fee exceeds the payment.
pub fn protocol_fee(
    cfg: &FeeConfig,
    oracle: &dyn PriceOracle,
    rate_type: FeeRateType,
    tier: u8,
    payment_asset: Address,
    notional: U256,
) -> MarginResult<U256> {
    let rate = u256_math::bps_to_wad(cfg.rate_bps(rate_type));
    let gross = u256_math::wad_mul(notional, rate, Rounding::Down)?;
    let discount = u256_math::bps_to_wad(cfg.tier_discount_bps(tier).min(10_000));
    let mut fee = u256_math::wad_mul(gross, u256_math::one_minus(discount)?, Rounding::Down)?;

    let min_fee = usd_to_asset(oracle, u256_math::f64_to_wad(cfg.min_protocol_fee_usd), payment_asset)?;
    if min_fee > notional {
        return Err(MarginError::MinFeeExceedsPayment {
            min_fee,
            payment: notional,
        });
    }
    fee = fee.max(min_fee);

    let max_fee = usd_to_asset(oracle, u256_math::f64_to_wad(cfg.max_protocol_fee_usd), payment_asset)?;
    if !max_fee.is_zero() {
        fee = fee.min(max_fee);
    }
    Ok(fee)
}

/// Fee converted to the discount token, with the discount multiplier
/// applied.
pub fn fee_in_discount_token(
    cfg: &FeeConfig,
    oracle: &dyn PriceOracle,
    fee: U256,
    payment_asset: Address,
    discount_token: Address,
) -> MarginResult<U256> {
    let rate = oracle.rate(payment_asset, discount_token)?;
    let converted = u256_math::wad_mul(fee, rate, Rounding::Down)?;
    Ok(u256_math::wad_mul(
        converted,
        u256_math::bps_to_wad(cfg.discount_multiplier_bps),
        Rounding::Down,
    )?)
}

/// Split a fee between the discount token and the payment asset given the
/// trader's discount-token balance. A short balance is spent in full and
/// the uncovered fraction of the fee is charged in the payment asset.
pub fn split_discount_payment(
    fee: U256,
    fee_in_discount: U256,
    discount_available: U256,
) -> MarginResult<FeeSplit> {
    if fee_in_discount.is_zero() || discount_available >= fee_in_discount {
        return Ok(FeeSplit {
            in_payment_asset: U256::ZERO,
            in_discount_token: fee_in_discount,
        });
    }
    let uncovered = fee_in_discount - discount_available;
    Ok(FeeSplit {
        in_payment_asset: u256_math::mul_div(fee, uncovered, fee_in_discount, Rounding::Up)?,
        in_discount_token: discount_available,
    })
}
