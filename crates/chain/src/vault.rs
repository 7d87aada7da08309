//! Trader balance custody.
//!
//! Traders keep collateral in the vault as an `available` balance they
//! can trade from, and a `locked` balance reserved for pending orders.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Vault failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    #[error("insufficient available balance of {asset} for {trader}: have {available}, need {required}")]
    InsufficientAvailable {
        trader: Address,
        asset: Address,
        available: U256,
        required: U256,
    },

    #[error("insufficient locked balance of {asset} for {trader}: have {locked}, need {required}")]
    InsufficientLocked {
        trader: Address,
        asset: Address,
        locked: U256,
        required: U256,
    },

    #[error("zero amount")]
    ZeroAmount,
}

/// Balance pair of one trader for one asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultBalance {
    pub available: U256,
    pub locked: U256,
}

/// Custody seam used by the position lifecycle.
pub trait BalanceVault {
    /// Funds arriving from the trader's wallet.
    fn deposit(&mut self, trader: Address, asset: Address, amount: U256) -> Result<(), VaultError>;

    /// Funds leaving to the trader's wallet.
    fn withdraw(&mut self, trader: Address, asset: Address, amount: U256) -> Result<(), VaultError>;

    /// Move `amount` from available to locked.
    fn lock(&mut self, trader: Address, asset: Address, amount: U256) -> Result<(), VaultError>;

    /// Move `amount` from locked back to available.
    fn unlock(&mut self, trader: Address, asset: Address, amount: U256) -> Result<(), VaultError>;

    /// Credit `amount` to the available balance (settlement proceeds).
    fn credit(&mut self, trader: Address, asset: Address, amount: U256);

    /// Take `amount` out of the available balance for protocol use.
    fn debit_available(
        &mut self,
        trader: Address,
        asset: Address,
        amount: U256,
    ) -> Result<(), VaultError>;

    fn available(&self, trader: Address, asset: Address) -> U256;

    fn locked(&self, trader: Address, asset: Address) -> U256;
}

/// In-memory vault.
#[derive(Debug, Clone, Default)]
pub struct TraderBalanceVault {
    balances: HashMap<(Address, Address), VaultBalance>,
}

impl TraderBalanceVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full balance pair.
    pub fn balance(&self, trader: Address, asset: Address) -> VaultBalance {
        self.balances
            .get(&(trader, asset))
            .copied()
            .unwrap_or_default()
    }

    /// Sum of available balances held for `asset` across all traders.
    pub fn total_available(&self, asset: Address) -> U256 {
        self.balances
            .iter()
            .filter(|((_, a), _)| *a == asset)
            .fold(U256::ZERO, |acc, (_, b)| acc + b.available)
    }

    fn entry(&mut self, trader: Address, asset: Address) -> &mut VaultBalance {
        self.balances.entry((trader, asset)).or_default()
    }

    fn take_available(
        &mut self,
        trader: Address,
        asset: Address,
        amount: U256,
    ) -> Result<(), VaultError> {
        let balance = self.entry(trader, asset);
        if balance.available < amount {
            return Err(VaultError::InsufficientAvailable {
                trader,
                asset,
                available: balance.available,
                required: amount,
            });
        }
        balance.available -= amount;
        Ok(())
    }
}

impl BalanceVault for TraderBalanceVault {
    fn deposit(&mut self, trader: Address, asset: Address, amount: U256) -> Result<(), VaultError> {
        if amount.is_zero() {
            return Err(VaultError::ZeroAmount);
        }
        self.entry(trader, asset).available += amount;
        debug!(%trader, %asset, %amount, "Vault deposit");
        Ok(())
    }

    fn withdraw(&mut self, trader: Address, asset: Address, amount: U256) -> Result<(), VaultError> {
        if amount.is_zero() {
            return Err(VaultError::ZeroAmount);
        }
        self.take_available(trader, asset, amount)?;
        debug!(%trader, %asset, %amount, "Vault withdraw");
        Ok(())
    }

    fn lock(&mut self, trader: Address, asset: Address, amount: U256) -> Result<(), VaultError> {
        self.take_available(trader, asset, amount)?;
        self.entry(trader, asset).locked += amount;
        Ok(())
    }

    fn unlock(&mut self, trader: Address, asset: Address, amount: U256) -> Result<(), VaultError> {
        let balance = self.entry(trader, asset);
        if balance.locked < amount {
            return Err(VaultError::InsufficientLocked {
                trader,
                asset,
                locked: balance.locked,
                required: amount,
            });
        }
        balance.locked -= amount;
        balance.available += amount;
        Ok(())
    }

    fn credit(&mut self, trader: Address, asset: Address, amount: U256) {
        if amount.is_zero() {
            return;
        }
        self.entry(trader, asset).available += amount;
    }

    fn debit_available(
        &mut self,
        trader: Address,
        asset: Address,
        amount: U256,
    ) -> Result<(), VaultError> {
        self.take_available(trader, asset, amount)
    }

    fn available(&self, trader: Address, asset: Address) -> U256 {
        self.balance(trader, asset).available
    }

    fn locked(&self, trader: Address, asset: Address) -> U256 {
        self.balance(trader, asset).locked
    }
}
