//! Swap execution seams and the in-process multi-venue router.

use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

use crate::route::{split_amounts, RouteError, RouteNode};

/// WAD constant: 1e18 for 18-decimal fixed-point arithmetic
const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// Basis points denominator (10000 = 100%)
const BPS_DENOMINATOR: U256 = U256::from_limbs([10000u64, 0, 0, 0]);

/// Swap failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DexError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("unknown venue {0}")]
    UnknownVenue(String),

    #[error("venue {venue} has no pool for {token_in} -> {token_out}")]
    NoPool {
        venue: String,
        token_in: Address,
        token_out: Address,
    },

    #[error("slippage exceeded: got {amount_out}, minimum {min_out}")]
    SlippageExceeded { amount_out: U256, min_out: U256 },

    #[error("arithmetic overflow in venue pricing")]
    Overflow,
}

/// A single liquidity venue able to price one hop.
pub trait Venue: Send + Sync + Debug {
    /// Identifier used by route legs.
    fn venue_id(&self) -> &str;

    /// Output of swapping exactly `amount_in` of `token_in` for `token_out`.
    fn swap_exact_in(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> Result<U256, DexError>;
}

/// Trait for swap routers.
///
/// The protocol hands a router a validated route tree and the amount to
/// swap; the router returns the realised output.
pub trait SwapRouter: Send + Sync + Debug {
    fn router_id(&self) -> &str;

    /// Expected output of `route` for `amount_in`, without side effects.
    fn quote(&self, route: &RouteNode, amount_in: U256) -> Result<U256, DexError>;

    /// Execute `route`, failing when the output is below `min_out`.
    fn swap(
        &self,
        route: &RouteNode,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        min_out: U256,
    ) -> Result<U256, DexError> {
        route.validate(token_in, token_out)?;
        let amount_out = self.quote(route, amount_in)?;
        if amount_out < min_out {
            return Err(DexError::SlippageExceeded {
                amount_out,
                min_out,
            });
        }
        debug!(
            router = self.router_id(),
            %token_in,
            %token_out,
            %amount_in,
            %amount_out,
            "Swap executed"
        );
        Ok(amount_out)
    }
}

/// Router that walks a route tree over registered venues.
#[derive(Debug, Default)]
pub struct MultiVenueRouter {
    venues: HashMap<String, Arc<dyn Venue>>,
}

impl MultiVenueRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a venue under its own identifier.
    pub fn with_venue(mut self, venue: Arc<dyn Venue>) -> Self {
        self.venues.insert(venue.venue_id().to_string(), venue);
        self
    }

    pub fn venue(&self, id: &str) -> Option<Arc<dyn Venue>> {
        self.venues.get(id).cloned()
    }

    fn walk(&self, node: &RouteNode, amount_in: U256) -> Result<U256, DexError> {
        match node {
            RouteNode::Leg(leg) => {
                let venue = self
                    .venues
                    .get(&leg.venue)
                    .ok_or_else(|| DexError::UnknownVenue(leg.venue.clone()))?;
                leg.path.windows(2).try_fold(amount_in, |amount, hop| {
                    let out = venue.swap_exact_in(hop[0], hop[1], amount)?;
                    trace!(venue = %leg.venue, from = %hop[0], to = %hop[1], %amount, %out, "Hop");
                    Ok::<_, DexError>(out)
                })
            }
            RouteNode::Split(branches) => split_amounts(amount_in, branches)
                .into_iter()
                .zip(branches)
                .try_fold(U256::ZERO, |acc, (part, (_, branch))| {
                    let out = self.walk(branch, part)?;
                    acc.checked_add(out).ok_or(DexError::Overflow)
                }),
            RouteNode::Sequence(hops) => hops
                .iter()
                .try_fold(amount_in, |amount, hop| self.walk(hop, amount)),
        }
    }
}

impl SwapRouter for MultiVenueRouter {
    fn router_id(&self) -> &str {
        "multi-venue"
    }

    fn quote(&self, route: &RouteNode, amount_in: U256) -> Result<U256, DexError> {
        route.endpoints()?;
        self.walk(route, amount_in)
    }
}

/// Venue quoting every pair at a fixed WAD rate minus a flat fee.
#[derive(Debug)]
pub struct ConstantRateVenue {
    id: String,
    fee_bps: u16,
    /// (token_in, token_out) -> WAD rate
    rates: DashMap<(Address, Address), U256>,
}

impl ConstantRateVenue {
    pub fn new(id: impl Into<String>, fee_bps: u16) -> Self {
        Self {
            id: id.into(),
            fee_bps,
            rates: DashMap::new(),
        }
    }

    /// Set the rate for `token_in -> token_out`; the opposite direction is
    /// derived from it unless set explicitly afterwards.
    pub fn set_rate(&self, token_in: Address, token_out: Address, rate: U256) {
        self.rates.insert((token_in, token_out), rate);
        self.rates.remove(&(token_out, token_in));
    }

    fn rate(&self, token_in: Address, token_out: Address) -> Option<U256> {
        if token_in == token_out {
            return Some(WAD);
        }
        if let Some(rate) = self.rates.get(&(token_in, token_out)) {
            return Some(*rate);
        }
        let inverse = *self.rates.get(&(token_out, token_in))?;
        if inverse.is_zero() {
            return None;
        }
        (WAD * WAD).checked_div(inverse)
    }
}

impl Venue for ConstantRateVenue {
    fn venue_id(&self) -> &str {
        &self.id
    }

    fn swap_exact_in(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> Result<U256, DexError> {
        let rate = self
            .rate(token_in, token_out)
            .ok_or_else(|| DexError::NoPool {
                venue: self.id.clone(),
                token_in,
                token_out,
            })?;
        let gross = amount_in
            .checked_mul(rate)
            .map(|v| v / WAD)
            .ok_or(DexError::Overflow)?;
        let keep = BPS_DENOMINATOR - U256::from(self.fee_bps.min(10_000));
        gross
            .checked_mul(keep)
            .map(|v| v / BPS_DENOMINATOR)
            .ok_or(DexError::Overflow)
    }
}
