//! Price oracle seam.
//!
//! The protocol core never aggregates prices itself: it asks a
//! [`PriceOracle`] for WAD-scaled exchange rates and for the maximum
//! expected pair price drop used by the health formula.
//!
//! Rates are expressed as "units of `quote` per one unit of `base`",
//! scaled by 1e18. Token decimals are assumed to be normalised by the
//! oracle itself.
//!
//! # Example
//!
//! ```rust,ignore
//! use margin_chain::oracle::{PriceOracle, StaticOracle, USD};
//!
//! let oracle = StaticOracle::new();
//! oracle.set_rate(weth, USD, wad(2000));
//! let rate = oracle.rate(weth, USD)?;
//! ```

mod staged;
mod static_feed;
mod types;

pub use staged::StagedOracle;
pub use static_feed::StaticOracle;
pub use types::{OracleData, OracleError, PullUpdate, PULL_PAYLOAD_LEN, USD};

use alloy::primitives::{Address, U256};
use std::fmt::Debug;

/// Core trait for oracle interactions.
pub trait PriceOracle: Send + Sync + Debug {
    /// WAD-scaled amount of `quote` paid for one unit of `base`.
    fn rate(&self, base: Address, quote: Address) -> Result<U256, OracleError>;

    /// Maximum tolerated one-block price drop for the pair, WAD-scaled.
    fn pair_price_drop(&self, asset_a: Address, asset_b: Address) -> U256;

    /// Apply pull-style price updates. Fee coverage is checked by the caller.
    fn update_pull_prices(&self, updates: &[PullUpdate]) -> Result<(), OracleError> {
        let _ = updates;
        Ok(())
    }
}
