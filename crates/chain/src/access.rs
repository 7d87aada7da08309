//! Caller gating and trader tiers.
//!
//! Role management and governance are external; the core only needs to
//! know whether a sender is blacklisted, whether it is trusted to use the
//! widened oracle tolerance, and which fee tier a trader belongs to.

use alloy::primitives::Address;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;

pub trait AccessGate: Send + Sync + Debug {
    fn is_blacklisted(&self, account: Address) -> bool;

    /// Trusted callers get the oracle tolerance multiplied.
    fn is_trusted(&self, account: Address) -> bool;
}

pub trait TierProvider: Send + Sync + Debug {
    /// Fee tier of the trader; 0 is the base tier.
    fn trader_tier(&self, trader: Address) -> u8;
}

/// Access gate backed by two address sets.
#[derive(Debug, Default)]
pub struct StaticAccessGate {
    blacklist: RwLock<HashSet<Address>>,
    trusted: RwLock<HashSet<Address>>,
}

impl StaticAccessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blacklist(&self, account: Address) {
        self.blacklist.write().insert(account);
    }

    pub fn remove_from_blacklist(&self, account: Address) {
        self.blacklist.write().remove(&account);
    }

    pub fn trust(&self, account: Address) {
        self.trusted.write().insert(account);
    }
}

impl AccessGate for StaticAccessGate {
    fn is_blacklisted(&self, account: Address) -> bool {
        self.blacklist.read().contains(&account)
    }

    fn is_trusted(&self, account: Address) -> bool {
        self.trusted.read().contains(&account)
    }
}

/// Tier table keyed by trader.
#[derive(Debug, Default)]
pub struct StaticTiers {
    tiers: RwLock<HashMap<Address, u8>>,
}

impl StaticTiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tier(&self, trader: Address, tier: u8) {
        self.tiers.write().insert(trader, tier);
    }
}

impl TierProvider for StaticTiers {
    fn trader_tier(&self, trader: Address) -> u8 {
        self.tiers.read().get(&trader).copied().unwrap_or(0)
    }
}
