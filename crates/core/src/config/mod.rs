//! Configuration for the margin engine.
//!
//! This module provides:
//! - Engine runtime configuration (profiles, risk buffers, fee schedule)
//! - Market configuration (buckets, per-pair oracle tolerances) with a
//!   loader resolving addresses and `${ENV}` references

mod engine;
mod markets;

pub use engine::{EngineConfig, FeeConfig, PositionConfig};
pub use markets::{BucketEntry, MarketConfig, MarketLoader, PairEntry, ResolvedMarkets};
