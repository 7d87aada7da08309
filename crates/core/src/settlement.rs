//! Per-position close settlement.
//!
//! Splits realised proceeds between bucket debt, protocol fee, trader and
//! treasury. The same computation backs single closes and every entry of a
//! batch close; bucket and vault effects are applied by the caller.

use alloy::primitives::{I256, U256};

use crate::error::MarginResult;
use crate::u256_math;

/// Who receives what is left once debt and fee are paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remainder {
    Trader,
    Treasury,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseOutcome {
    pub amount_out: U256,
    pub debt: U256,
    /// Portion of debt covered by proceeds
    pub repaid: U256,
    /// Uncovered debt, registered as permanent loss
    pub shortfall: U256,
    /// Fee taken from proceeds
    pub fee: U256,
    pub to_trader: U256,
    pub to_treasury: U256,
    /// Trader result relative to the deposit
    pub profit: I256,
}

/// Settle `amount_out` against `debt`. `fee` must already be capped at the
/// proceeds left after debt.
pub fn settle(
    amount_out: U256,
    debt: U256,
    deposit: U256,
    fee: U256,
    remainder: Remainder,
) -> MarginResult<CloseOutcome> {
    let repaid = amount_out.min(debt);
    let shortfall = debt - repaid;
    let left = amount_out - repaid;
    let fee = fee.min(left);
    let (to_trader, to_treasury) = match remainder {
        Remainder::Trader => (left - fee, U256::ZERO),
        Remainder::Treasury => (U256::ZERO, left - fee),
    };
    Ok(CloseOutcome {
        amount_out,
        debt,
        repaid,
        shortfall,
        fee,
        to_trader,
        to_treasury,
        profit: u256_math::signed_diff(to_trader, deposit)?,
    })
}

/// Pro-rata split of one aggregate swap output by position amount, floor
/// rounded per position through a WAD share. The sum never exceeds
/// `amount_out`.
pub fn pro_rata(amounts: &[U256], amount_out: U256) -> MarginResult<Vec<U256>> {
    let total = amounts
        .iter()
        .try_fold(U256::ZERO, |acc, a| u256_math::add(acc, *a))?;
    amounts
        .iter()
        .map(|amount| {
            let share = u256_math::wad_div(*amount, total, u256_math::Rounding::Down)?;
            Ok(u256_math::wad_mul(
                amount_out,
                share,
                u256_math::Rounding::Down,
            )?)
        })
        .collect()
}
