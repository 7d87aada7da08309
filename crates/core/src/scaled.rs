//! Scaled-balance token model.
//!
//! Balances are stored divided by the bucket index at the time they were
//! minted; the real balance is `scaled * index / RAY`, so interest accrues
//! to every holder by moving the index alone.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{MarginError, MarginResult};
use crate::u256_math::{self, Rounding};

/// Plain scaled ledger shared by the debt and credit roles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaledLedger {
    balances: BTreeMap<Address, U256>,
    scaled_total_supply: U256,
}

impl ScaledLedger {
    pub fn mint_scaled(&mut self, holder: Address, scaled: U256) -> MarginResult<()> {
        if scaled.is_zero() {
            return Ok(());
        }
        let balance = self.balances.entry(holder).or_default();
        *balance = u256_math::add(*balance, scaled)?;
        self.scaled_total_supply = u256_math::add(self.scaled_total_supply, scaled)?;
        Ok(())
    }

    /// Burn `scaled` from `holder`. Burning the whole balance removes the
    /// holder entry.
    pub fn burn_scaled(&mut self, holder: Address, scaled: U256) -> MarginResult<()> {
        if scaled.is_zero() {
            return Ok(());
        }
        let held = self.scaled_balance_of(holder);
        if held < scaled {
            return Err(MarginError::InsufficientScaledBalance {
                holder,
                held,
                requested: scaled,
            });
        }
        if held == scaled {
            self.balances.remove(&holder);
        } else {
            self.balances.insert(holder, held - scaled);
        }
        self.scaled_total_supply = u256_math::sub(self.scaled_total_supply, scaled)?;
        Ok(())
    }

    pub fn scaled_balance_of(&self, holder: Address) -> U256 {
        self.balances.get(&holder).copied().unwrap_or_default()
    }

    pub fn scaled_total_supply(&self) -> U256 {
        self.scaled_total_supply
    }

    /// Real balance at `index` (floor).
    pub fn balance_of(&self, holder: Address, index: U256) -> MarginResult<U256> {
        Ok(u256_math::ray_mul(
            self.scaled_balance_of(holder),
            index,
            Rounding::Down,
        )?)
    }

    /// Real total supply at `index` (floor).
    pub fn total_supply(&self, index: U256) -> MarginResult<U256> {
        Ok(u256_math::ray_mul(
            self.scaled_total_supply,
            index,
            Rounding::Down,
        )?)
    }

    pub fn holders(&self) -> usize {
        self.balances.len()
    }
}

/// Borrower debt, scaled by the variable borrow index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebtToken {
    ledger: ScaledLedger,
}

impl DebtToken {
    /// Mint debt worth `amount` at `borrow_index`; returns the scaled amount.
    pub fn mint(&mut self, trader: Address, amount: U256, borrow_index: U256) -> MarginResult<U256> {
        let scaled = u256_math::ray_div(amount, borrow_index, Rounding::Down)?;
        self.ledger.mint_scaled(trader, scaled)?;
        Ok(scaled)
    }

    pub fn burn_scaled(&mut self, trader: Address, scaled: U256) -> MarginResult<()> {
        self.ledger.burn_scaled(trader, scaled)
    }

    pub fn ledger(&self) -> &ScaledLedger {
        &self.ledger
    }
}

/// Lender credit, scaled by the liquidity index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditToken {
    ledger: ScaledLedger,
}

impl CreditToken {
    /// Mint credit worth `amount` at `liquidity_index`; returns the scaled amount.
    pub fn mint(
        &mut self,
        lender: Address,
        amount: U256,
        liquidity_index: U256,
    ) -> MarginResult<U256> {
        let scaled = u256_math::ray_div(amount, liquidity_index, Rounding::Down)?;
        self.ledger.mint_scaled(lender, scaled)?;
        Ok(scaled)
    }

    pub fn burn_scaled(&mut self, lender: Address, scaled: U256) -> MarginResult<()> {
        self.ledger.burn_scaled(lender, scaled)
    }

    pub fn ledger(&self) -> &ScaledLedger {
        &self.ledger
    }
}
