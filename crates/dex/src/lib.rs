//! Swap routing layer for the margin protocol.
//!
//! This crate provides:
//! - The recursive route tree (`RouteNode`) with structural validation
//! - The `SwapRouter` and `Venue` seams consumed by the protocol core
//! - An in-process `MultiVenueRouter` and a `ConstantRateVenue` used for
//!   simulation and tests
//!
//! # Example
//!
//! ```rust,ignore
//! use margin_dex::{ConstantRateVenue, MultiVenueRouter, RouteNode, SwapRouter};
//!
//! let venue = ConstantRateVenue::new("uni", 30);
//! venue.set_rate(usdc, weth, rate);
//! let router = MultiVenueRouter::new().with_venue(Arc::new(venue));
//! let out = router.swap(&RouteNode::leg("uni", usdc, weth), usdc, weth, amount, min_out)?;
//! ```

mod route;
mod router;

pub use route::{Leg, RouteError, RouteNode};
pub use router::{ConstantRateVenue, DexError, MultiVenueRouter, SwapRouter, Venue};
