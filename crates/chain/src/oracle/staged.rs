//! Call-scoped price overlay for pull updates.

use alloy::primitives::{Address, U256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use super::types::WAD;
use super::{OracleError, PriceOracle, PullUpdate};

/// Serves pull-update rates staged during one protocol call on top of a
/// backing oracle. The backing oracle is not touched until the staged
/// updates are handed back with [`StagedOracle::into_updates`] and applied
/// by the caller.
pub struct StagedOracle<'a> {
    inner: &'a dyn PriceOracle,
    /// (base, quote) -> WAD rate
    rates: BTreeMap<(Address, Address), U256>,
    updates: Vec<PullUpdate>,
}

impl<'a> StagedOracle<'a> {
    pub fn new(inner: &'a dyn PriceOracle) -> Self {
        Self {
            inner,
            rates: BTreeMap::new(),
            updates: Vec::new(),
        }
    }

    /// Decode and stage `updates`. A bad payload stages nothing.
    pub fn stage(&mut self, updates: &[PullUpdate]) -> Result<(), OracleError> {
        let decoded = updates
            .iter()
            .map(PullUpdate::decode)
            .collect::<Result<Vec<_>, _>>()?;
        for (base, quote, rate) in decoded {
            debug!(%base, %quote, %rate, "Staging pull oracle update");
            self.rates.insert((base, quote), rate);
            self.rates.remove(&(quote, base));
        }
        self.updates.extend_from_slice(updates);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Staged updates in arrival order, for applying to the backing oracle.
    pub fn into_updates(self) -> Vec<PullUpdate> {
        self.updates
    }

    fn staged(&self, base: Address, quote: Address) -> Option<Result<U256, OracleError>> {
        if let Some(rate) = self.rates.get(&(base, quote)) {
            if rate.is_zero() {
                return Some(Err(OracleError::ZeroRate { base, quote }));
            }
            return Some(Ok(*rate));
        }
        let inverse = self.rates.get(&(quote, base))?;
        if inverse.is_zero() {
            return Some(Err(OracleError::ZeroRate { base, quote }));
        }
        // 1e36 / inverse, floor
        Some(
            WAD.checked_mul(WAD)
                .and_then(|n| n.checked_div(*inverse))
                .ok_or(OracleError::Overflow),
        )
    }
}

impl fmt::Debug for StagedOracle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedOracle")
            .field("inner", &self.inner)
            .field("rates", &self.rates)
            .finish()
    }
}

impl PriceOracle for StagedOracle<'_> {
    fn rate(&self, base: Address, quote: Address) -> Result<U256, OracleError> {
        if base == quote {
            return self.inner.rate(base, quote);
        }
        match self.staged(base, quote) {
            Some(rate) => rate,
            None => self.inner.rate(base, quote),
        }
    }

    fn pair_price_drop(&self, asset_a: Address, asset_b: Address) -> U256 {
        self.inner.pair_price_drop(asset_a, asset_b)
    }

    fn update_pull_prices(&self, _updates: &[PullUpdate]) -> Result<(), OracleError> {
        Err(OracleError::ReadOnly)
    }
}
