//! Interest-rate strategy.
//!
//! Rates are annual and RAY-scaled; utilization is RAY-scaled; the
//! bucket's reserve rate is a WAD fraction.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::u256_math::{self, MathResult, Rounding, RAY, SECONDS_PER_YEAR, WAD};

/// Two-slope rate model parameters (all RAY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateModelParams {
    /// Borrow rate at zero utilization
    pub base_rate: U256,
    /// Rate added between zero and optimal utilization
    pub slope1: U256,
    /// Rate added between optimal and full utilization
    pub slope2: U256,
    /// Kink
    pub optimal_utilization: U256,
}

impl RateModelParams {
    /// Constant borrow rate regardless of utilization.
    pub fn fixed(rate: U256) -> Self {
        Self {
            base_rate: rate,
            slope1: U256::ZERO,
            slope2: U256::ZERO,
            optimal_utilization: RAY,
        }
    }
}

/// Pure mapping from pool utilization to rates.
pub trait InterestRateStrategy: Send + Sync + Debug {
    /// Returns `(borrow_rate, liquidity_rate)`.
    fn rates(
        &self,
        utilization: U256,
        params: &RateModelParams,
        reserve_rate: U256,
    ) -> MathResult<(U256, U256)>;

    /// Approximation of `(1 + rate / SECONDS_PER_YEAR) ^ elapsed` in RAY,
    /// using the first three binomial terms with floor multiplies.
    fn compounded_factor(&self, rate: U256, elapsed: u64) -> MathResult<U256> {
        if elapsed == 0 || rate.is_zero() {
            return Ok(RAY);
        }
        let exp = U256::from(elapsed);
        let exp_minus_one = U256::from(elapsed - 1);
        let exp_minus_two = U256::from(elapsed.saturating_sub(2));

        let rate_per_second = rate / U256::from(SECONDS_PER_YEAR);
        let base_pow_two = u256_math::ray_mul(rate_per_second, rate_per_second, Rounding::Down)?;
        let base_pow_three = u256_math::ray_mul(base_pow_two, rate_per_second, Rounding::Down)?;

        let first = rate_per_second.checked_mul(exp).ok_or(u256_math::MathError::Overflow)?;
        let second = exp
            .checked_mul(exp_minus_one)
            .and_then(|v| v.checked_mul(base_pow_two))
            .ok_or(u256_math::MathError::Overflow)?
            / U256::from(2u8);
        let third = exp
            .checked_mul(exp_minus_one)
            .and_then(|v| v.checked_mul(exp_minus_two))
            .and_then(|v| v.checked_mul(base_pow_three))
            .ok_or(u256_math::MathError::Overflow)?
            / U256::from(6u8);

        u256_math::add(u256_math::add(RAY, first)?, u256_math::add(second, third)?)
    }
}

/// Kinked (two-slope) utilization model.
#[derive(Debug, Clone, Copy, Default)]
pub struct KinkedRateStrategy;

impl KinkedRateStrategy {
    fn borrow_rate(utilization: U256, params: &RateModelParams) -> MathResult<U256> {
        let u = utilization.min(RAY);
        let u_opt = params.optimal_utilization;
        if u_opt.is_zero() {
            return u256_math::add(
                params.base_rate,
                u256_math::add(params.slope1, u256_math::ray_mul(params.slope2, u, Rounding::Down)?)?,
            );
        }
        if u <= u_opt {
            let ratio = u256_math::ray_div(u, u_opt, Rounding::Down)?;
            return u256_math::add(
                params.base_rate,
                u256_math::ray_mul(params.slope1, ratio, Rounding::Down)?,
            );
        }
        // u > u_opt implies u_opt < RAY
        let excess = u256_math::ray_div(u - u_opt, RAY - u_opt, Rounding::Down)?;
        u256_math::add(
            u256_math::add(params.base_rate, params.slope1)?,
            u256_math::ray_mul(params.slope2, excess, Rounding::Down)?,
        )
    }
}

impl InterestRateStrategy for KinkedRateStrategy {
    fn rates(
        &self,
        utilization: U256,
        params: &RateModelParams,
        reserve_rate: U256,
    ) -> MathResult<(U256, U256)> {
        let bar = Self::borrow_rate(utilization, params)?;
        let gross = u256_math::ray_mul(bar, utilization.min(RAY), Rounding::Down)?;
        let lar = u256_math::wad_mul(gross, u256_math::one_minus(reserve_rate.min(WAD))?, Rounding::Down)?;
        Ok((bar, lar))
    }
}

/// RAY utilization: `debt / (debt + available)`; zero for an empty pool.
pub fn utilization(total_debt: U256, available_liquidity: U256) -> MathResult<U256> {
    let total = u256_math::add(total_debt, available_liquidity)?;
    if total.is_zero() {
        return Ok(U256::ZERO);
    }
    u256_math::ray_div(total_debt, total, Rounding::Down)
}
