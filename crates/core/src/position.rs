//! Position data and risk math.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::conditions::CloseCondition;
use crate::error::MarginResult;
use crate::u256_math::{self, Rounding, WAD};

/// Leveraged or spot position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub id: u64,
    pub trader: Address,
    /// `None` for spot positions
    pub bucket: Option<Address>,
    pub position_asset: Address,
    pub sold_asset: Address,
    /// Only ever decreases
    pub position_amount: U256,
    pub deposit_amount_in_sold_asset: U256,
    pub scaled_debt_amount: U256,
    /// Borrow index when the position was opened
    pub open_borrow_index: U256,
    pub created_at: u64,
    pub updated_conditions_at: u64,
    pub close_conditions: SmallVec<[CloseCondition; 2]>,
    /// Trader elected to pay fees in the discount token
    pub fee_in_discount_token: bool,
}

impl Position {
    pub fn is_spot(&self) -> bool {
        self.bucket.is_none()
    }

    /// Debt at the bucket's live borrow index (floor).
    pub fn debt(&self, variable_borrow_index: U256) -> MarginResult<U256> {
        if self.is_spot() {
            return Ok(U256::ZERO);
        }
        Ok(u256_math::ray_mul(
            self.scaled_debt_amount,
            variable_borrow_index,
            Rounding::Down,
        )?)
    }
}

/// Discounts stacked on the position value in the health formula (WAD).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthParams {
    pub security_buffer: U256,
    pub oracle_tolerable_limit: U256,
    pub pair_price_drop: U256,
    /// Multiplier on debt (>= 1)
    pub fee_buffer: U256,
}

/// Health ratio in WAD:
/// `(1-sb)(1-otl)(1-ppd) * value / (feeBuffer * debt)`.
///
/// The discounts are applied in that order with a floor wad-multiply at
/// every step. Zero debt is infinitely healthy.
pub fn health_ratio(value_in_sold: U256, debt: U256, params: &HealthParams) -> MarginResult<U256> {
    if debt.is_zero() {
        return Ok(U256::MAX);
    }
    let mut factor = u256_math::one_minus(params.security_buffer)?;
    factor = u256_math::wad_mul(
        factor,
        u256_math::one_minus(params.oracle_tolerable_limit)?,
        Rounding::Down,
    )?;
    factor = u256_math::wad_mul(
        factor,
        u256_math::one_minus(params.pair_price_drop)?,
        Rounding::Down,
    )?;
    let numerator = u256_math::wad_mul(factor, value_in_sold, Rounding::Down)?;
    let denominator = u256_math::wad_mul(params.fee_buffer, debt, Rounding::Down)?;
    if denominator.is_zero() {
        return Ok(U256::MAX);
    }
    Ok(u256_math::wad_div(numerator, denominator, Rounding::Down)?)
}

/// Liquidatable iff health is below one WAD.
#[inline]
pub fn is_risky(health: U256) -> bool {
    health < WAD
}
