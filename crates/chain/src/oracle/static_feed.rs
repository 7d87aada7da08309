//! In-process oracle backed by a concurrent rate table.

use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use tracing::debug;

use super::types::WAD;
use super::{OracleError, PriceOracle, PullUpdate};

/// Oracle serving rates that are pushed to it directly or through pull
/// updates. Inverse rates are derived when only one direction is known.
#[derive(Debug, Default)]
pub struct StaticOracle {
    /// (base, quote) -> WAD rate
    rates: DashMap<(Address, Address), U256>,
    /// Unordered pair -> WAD price drop
    price_drops: DashMap<(Address, Address), U256>,
}

impl StaticOracle {
    /// Create an empty oracle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rate for `base -> quote`, dropping any stored inverse so it
    /// is re-derived from this one.
    pub fn set_rate(&self, base: Address, quote: Address, rate: U256) {
        self.rates.insert((base, quote), rate);
        self.rates.remove(&(quote, base));
    }

    /// Set the expected pair price drop (order-independent).
    pub fn set_pair_price_drop(&self, asset_a: Address, asset_b: Address, drop: U256) {
        self.price_drops.insert(pair_key(asset_a, asset_b), drop);
    }

    fn direct(&self, base: Address, quote: Address) -> Option<U256> {
        self.rates.get(&(base, quote)).map(|r| *r)
    }
}

impl PriceOracle for StaticOracle {
    fn rate(&self, base: Address, quote: Address) -> Result<U256, OracleError> {
        if base == quote {
            return Ok(WAD);
        }
        if let Some(rate) = self.direct(base, quote) {
            if rate.is_zero() {
                return Err(OracleError::ZeroRate { base, quote });
            }
            return Ok(rate);
        }

        let inverse = self
            .direct(quote, base)
            .ok_or(OracleError::MissingRate { base, quote })?;
        if inverse.is_zero() {
            return Err(OracleError::ZeroRate { base, quote });
        }
        // 1e36 / inverse, floor
        WAD.checked_mul(WAD)
            .and_then(|n| n.checked_div(inverse))
            .ok_or(OracleError::Overflow)
    }

    fn pair_price_drop(&self, asset_a: Address, asset_b: Address) -> U256 {
        self.price_drops
            .get(&pair_key(asset_a, asset_b))
            .map(|d| *d)
            .unwrap_or(U256::ZERO)
    }

    fn update_pull_prices(&self, updates: &[PullUpdate]) -> Result<(), OracleError> {
        // Decode everything first so a bad payload leaves the table untouched.
        let decoded = updates
            .iter()
            .map(PullUpdate::decode)
            .collect::<Result<Vec<_>, _>>()?;

        for (base, quote, rate) in decoded {
            debug!(%base, %quote, %rate, "Applying pull oracle update");
            self.set_rate(base, quote, rate);
        }
        Ok(())
    }
}

fn pair_key(a: Address, b: Address) -> (Address, Address) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
