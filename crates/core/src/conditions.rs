//! Pluggable close conditions.
//!
//! A condition is a kind tag plus an opaque parameter blob of 32-byte
//! big-endian words. Validation dispatches through [`ConditionRegistry`],
//! a lookup table from kind to validator.
//!
//! Prices are WAD-scaled amounts of sold asset per unit of position asset.

use alloy::primitives::{Bytes, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{MarginError, MarginResult};

const WORD: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConditionKind {
    /// Words: take-profit price, stop-loss price. Zero disables a leg.
    TakeProfitStopLoss,
    /// Word: minimum realised exit price.
    LimitPrice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseCondition {
    pub kind: ConditionKind,
    pub params: Bytes,
}

impl CloseCondition {
    pub fn take_profit_stop_loss(take_profit: U256, stop_loss: U256) -> Self {
        Self {
            kind: ConditionKind::TakeProfitStopLoss,
            params: encode_words(&[take_profit, stop_loss]),
        }
    }

    pub fn limit_price(min_exit_price: U256) -> Self {
        Self {
            kind: ConditionKind::LimitPrice,
            params: encode_words(&[min_exit_price]),
        }
    }
}

/// Which leg of a condition a close is allowed to fire on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerLeg {
    Any,
    StopLoss,
    TakeProfit,
}

/// Market observations a condition is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct ConditionContext {
    /// Oracle price of the position asset in sold asset
    pub oracle_price: U256,
    /// Realised dex price of the close
    pub exit_price: U256,
    pub leg: TriggerLeg,
}

type Validator = fn(&[U256], &ConditionContext) -> bool;

#[derive(Debug, Clone, Copy)]
struct Entry {
    words: usize,
    check: Validator,
}

/// Kind -> validator table.
#[derive(Debug, Clone)]
pub struct ConditionRegistry {
    entries: HashMap<ConditionKind, Entry>,
}

impl Default for ConditionRegistry {
    fn default() -> Self {
        Self::new()
            .with(ConditionKind::TakeProfitStopLoss, 2, take_profit_stop_loss)
            .with(ConditionKind::LimitPrice, 1, limit_price)
    }
}

impl ConditionRegistry {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    fn with(mut self, kind: ConditionKind, words: usize, check: Validator) -> Self {
        self.entries.insert(kind, Entry { words, check });
        self
    }

    /// Decode the parameter blob, checking its width against the kind.
    fn decode(&self, condition: &CloseCondition) -> MarginResult<(Entry, Vec<U256>)> {
        let invalid = || MarginError::InvalidConditionParams {
            kind: condition.kind,
            len: condition.params.len(),
        };
        let entry = *self.entries.get(&condition.kind).ok_or_else(invalid)?;
        if condition.params.len() != entry.words * WORD {
            return Err(invalid());
        }
        let words = condition
            .params
            .chunks_exact(WORD)
            .map(U256::from_be_slice)
            .collect();
        Ok((entry, words))
    }

    pub fn validate_params(&self, condition: &CloseCondition) -> MarginResult<()> {
        self.decode(condition).map(|_| ())
    }

    pub fn is_met(&self, condition: &CloseCondition, ctx: &ConditionContext) -> MarginResult<bool> {
        let (entry, words) = self.decode(condition)?;
        Ok((entry.check)(&words, ctx))
    }
}

fn take_profit_stop_loss(words: &[U256], ctx: &ConditionContext) -> bool {
    let (take_profit, stop_loss) = (words[0], words[1]);
    let tp_hit = !take_profit.is_zero() && ctx.exit_price >= take_profit;
    let sl_hit = !stop_loss.is_zero() && ctx.oracle_price <= stop_loss;
    match ctx.leg {
        TriggerLeg::Any => tp_hit || sl_hit,
        TriggerLeg::TakeProfit => tp_hit,
        TriggerLeg::StopLoss => sl_hit,
    }
}

fn limit_price(words: &[U256], ctx: &ConditionContext) -> bool {
    let min_exit = words[0];
    match ctx.leg {
        TriggerLeg::StopLoss => false,
        TriggerLeg::Any | TriggerLeg::TakeProfit => {
            !min_exit.is_zero() && ctx.exit_price >= min_exit
        }
    }
}

fn encode_words(words: &[U256]) -> Bytes {
    let mut buf = Vec::with_capacity(words.len() * WORD);
    for word in words {
        buf.extend_from_slice(&word.to_be_bytes::<WORD>());
    }
    Bytes::from(buf)
}
