//! Position registry with trader and bucket reverse indices.

use alloy::primitives::{Address, U256};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{MarginError, MarginResult};
use crate::position::Position;

/// Open positions keyed by id.
#[derive(Debug, Clone, Default)]
pub struct PositionTracker {
    positions: BTreeMap<u64, Position>,

    /// Reverse index: trader → position ids
    by_trader: BTreeMap<Address, BTreeSet<u64>>,

    /// Reverse index: bucket → position ids (margin positions only)
    by_bucket: BTreeMap<Address, BTreeSet<u64>>,

    next_id: u64,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Reserve the next position id.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }

    pub fn insert(&mut self, position: Position) {
        self.by_trader
            .entry(position.trader)
            .or_default()
            .insert(position.id);
        if let Some(bucket) = position.bucket {
            self.by_bucket.entry(bucket).or_default().insert(position.id);
        }
        self.positions.insert(position.id, position);
    }

    /// Remove a position and its reverse-index entries.
    pub fn remove(&mut self, id: u64) -> MarginResult<Position> {
        let position = self
            .positions
            .remove(&id)
            .ok_or(MarginError::PositionNotFound(id))?;

        if let Some(ids) = self.by_trader.get_mut(&position.trader) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_trader.remove(&position.trader);
            }
        }
        if let Some(bucket) = position.bucket {
            if let Some(ids) = self.by_bucket.get_mut(&bucket) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_bucket.remove(&bucket);
                }
            }
        }
        Ok(position)
    }

    pub fn get(&self, id: u64) -> MarginResult<&Position> {
        self.positions
            .get(&id)
            .ok_or(MarginError::PositionNotFound(id))
    }

    pub fn get_mut(&mut self, id: u64) -> MarginResult<&mut Position> {
        self.positions
            .get_mut(&id)
            .ok_or(MarginError::PositionNotFound(id))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.positions.contains_key(&id)
    }

    pub fn trader_position_count(&self, trader: Address) -> usize {
        self.by_trader.get(&trader).map_or(0, BTreeSet::len)
    }

    pub fn bucket_position_ids(&self, bucket: Address) -> Vec<u64> {
        self.by_bucket
            .get(&bucket)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Sum of scaled debt of the bucket's open positions.
    pub fn bucket_scaled_debt(&self, bucket: Address) -> U256 {
        self.by_bucket
            .get(&bucket)
            .into_iter()
            .flatten()
            .filter_map(|id| self.positions.get(id))
            .fold(U256::ZERO, |acc, p| acc + p.scaled_debt_amount)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            positions: self.positions.len(),
            spot: self.positions.values().filter(|p| p.is_spot()).count(),
            traders: self.by_trader.len(),
            buckets: self.by_bucket.len(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub positions: usize,
    pub spot: usize,
    pub traders: usize,
    pub buckets: usize,
}
