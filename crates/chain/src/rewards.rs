//! Keeper reward accounting seam.
//!
//! Reward amortisation formulas live outside the core; the protocol only
//! reports what a keeper did. A batch close reports one update covering
//! every position it closed.

use alloy::primitives::{Address, U256};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// What the keeper did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeeperActionType {
    /// Closed a position whose health dropped below one
    Liquidation,
    /// Executed a stop-loss or take-profit condition
    StopLoss,
    TakeProfit,
    /// Executed a limit-price close condition
    LimitPrice,
    /// Closed a position of a delisted bucket after its deadline
    BucketDelisted,
}

/// Parameters reported per keeper call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeeperRewardParams {
    pub keeper: Address,
    pub action: KeeperActionType,
    /// Number of positions handled by the call
    pub number_of_actions: u32,
    /// Sum of closed position amounts, in the position asset
    pub position_amount: U256,
    /// Asset the realised proceeds are denominated in
    pub payment_asset: Address,
    /// Sum of realised proceeds
    pub amount_out: U256,
}

pub trait KeeperRewardDistributor: Send + Sync + Debug {
    fn update_reward(&self, params: KeeperRewardParams);
}

/// Distributor that records every update, for simulation and tests.
#[derive(Debug, Default)]
pub struct RecordingRewardDistributor {
    updates: Mutex<Vec<KeeperRewardParams>>,
}

impl RecordingRewardDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every recorded update, oldest first.
    pub fn updates(&self) -> Vec<KeeperRewardParams> {
        self.updates.lock().clone()
    }

    /// Total actions credited to `keeper`.
    pub fn actions_of(&self, keeper: Address) -> u32 {
        self.updates
            .lock()
            .iter()
            .filter(|u| u.keeper == keeper)
            .map(|u| u.number_of_actions)
            .sum()
    }
}

impl KeeperRewardDistributor for RecordingRewardDistributor {
    fn update_reward(&self, params: KeeperRewardParams) {
        tracing::debug!(
            keeper = %params.keeper,
            action = ?params.action,
            actions = params.number_of_actions,
            "Keeper reward update"
        );
        self.updates.lock().push(params);
    }
}
