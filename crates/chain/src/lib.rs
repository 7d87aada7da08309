//! External collaborators of the margin protocol.
//!
//! This crate provides:
//! - The price oracle seam with pull-style update payloads
//! - Trader balance custody (`BalanceVault`)
//! - Keeper reward reporting
//! - Caller gating (blacklist, trusted callers) and trader fee tiers
//!
//! Each seam is a trait with an in-memory implementation suitable for
//! simulation and tests.

pub mod access;
pub mod oracle;
pub mod rewards;
pub mod vault;

pub use access::{AccessGate, StaticAccessGate, StaticTiers, TierProvider};
pub use oracle::{OracleData, OracleError, PriceOracle, PullUpdate, StagedOracle, StaticOracle, USD};
pub use rewards::{
    KeeperActionType, KeeperRewardDistributor, KeeperRewardParams, RecordingRewardDistributor,
};
pub use vault::{BalanceVault, TraderBalanceVault, VaultBalance, VaultError};
