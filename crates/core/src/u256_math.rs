//! U256 fixed-point arithmetic for bucket and position accounting.
//!
//! Every helper is checked: overflow and division by zero surface as
//! [`MathError`] instead of panicking, and every multiply-divide takes an
//! explicit [`Rounding`] direction.

use alloy::primitives::{I256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// WAD constant: 1e18 for 18-decimal fixed-point arithmetic
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// RAY constant: 1e27 for 27-decimal fixed-point arithmetic
pub const RAY: U256 = U256::from_limbs([11_515_845_246_265_065_472u64, 54_210_108, 0, 0]);

/// WAD per basis point: 1e14
const WAD_PER_BPS: U256 = U256::from_limbs([100_000_000_000_000u64, 0, 0, 0]);

/// 365 days
pub const SECONDS_PER_YEAR: u64 = 31_536_000;

pub type MathResult<T> = Result<T, MathError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MathError {
    #[error("arithmetic overflow")]
    Overflow,

    #[error("arithmetic underflow")]
    Underflow,

    #[error("division by zero")]
    DivisionByZero,
}

/// Rounding direction of a multiply-divide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rounding {
    /// Floor
    Down,
    /// Nearest, ties away from zero
    HalfUp,
    /// Ceiling
    Up,
}

/// `a * b / denom` with the requested rounding.
#[inline]
pub fn mul_div(a: U256, b: U256, denom: U256, rounding: Rounding) -> MathResult<U256> {
    if denom.is_zero() {
        return Err(MathError::DivisionByZero);
    }
    let product = a.checked_mul(b).ok_or(MathError::Overflow)?;
    let bias = match rounding {
        Rounding::Down => U256::ZERO,
        Rounding::HalfUp => denom / U256::from(2u8),
        Rounding::Up => denom - U256::from(1u8),
    };
    let biased = product.checked_add(bias).ok_or(MathError::Overflow)?;
    Ok(biased / denom)
}

/// Multiply two WAD values: (a * b) / WAD
#[inline]
pub fn wad_mul(a: U256, b: U256, rounding: Rounding) -> MathResult<U256> {
    mul_div(a, b, WAD, rounding)
}

/// Divide two WAD values: (a * WAD) / b
#[inline]
pub fn wad_div(a: U256, b: U256, rounding: Rounding) -> MathResult<U256> {
    mul_div(a, WAD, b, rounding)
}

/// Multiply two RAY values: (a * b) / RAY
#[inline]
pub fn ray_mul(a: U256, b: U256, rounding: Rounding) -> MathResult<U256> {
    mul_div(a, b, RAY, rounding)
}

/// Divide two RAY values: (a * RAY) / b
#[inline]
pub fn ray_div(a: U256, b: U256, rounding: Rounding) -> MathResult<U256> {
    mul_div(a, RAY, b, rounding)
}

#[inline]
pub fn add(a: U256, b: U256) -> MathResult<U256> {
    a.checked_add(b).ok_or(MathError::Overflow)
}

#[inline]
pub fn sub(a: U256, b: U256) -> MathResult<U256> {
    a.checked_sub(b).ok_or(MathError::Underflow)
}

/// `WAD - x`, the complement of a WAD fraction.
#[inline]
pub fn one_minus(x: U256) -> MathResult<U256> {
    sub(WAD, x)
}

/// Basis points to a WAD fraction (100 bps = 0.01e18).
#[inline]
pub fn bps_to_wad(bps: u32) -> U256 {
    U256::from(bps) * WAD_PER_BPS
}

/// Convert WAD (18 decimals) to f64.
/// Use only for display/logging, not for computation.
pub fn wad_to_f64(wad: U256) -> f64 {
    if wad <= U256::from(u128::MAX) {
        let value: u128 = wad.to();
        value as f64 / 1e18
    } else {
        let limbs = wad.as_limbs();
        let high = limbs[1] as f64 * (u64::MAX as f64 + 1.0);
        let low = limbs[0] as f64;
        (high + low) / 1e18
    }
}

/// Convert f64 to WAD (18 decimals). Used for USD amounts read from config.
pub fn f64_to_wad(value: f64) -> U256 {
    if value <= 0.0 || !value.is_finite() {
        return U256::ZERO;
    }
    U256::from((value * 1e18) as u128)
}

/// Reinterpret an unsigned amount as signed, failing above `I256::MAX`.
#[inline]
pub fn to_signed(value: U256) -> MathResult<I256> {
    if value > I256::MAX.into_raw() {
        return Err(MathError::Overflow);
    }
    Ok(I256::from_raw(value))
}

/// `a - b` as a signed value.
#[inline]
pub fn signed_diff(a: U256, b: U256) -> MathResult<I256> {
    to_signed(a)?
        .checked_sub(to_signed(b)?)
        .ok_or(MathError::Overflow)
}
