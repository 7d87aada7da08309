//! Protocol events.
//!
//! Every entry point records events into the transaction's pending list;
//! they reach the [`EventLog`] only when the call commits.

use alloy::primitives::{Address, I256, U256};
use serde::{Deserialize, Serialize};

use crate::fees::FeeRateType;

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    ClosedByTrader,
    /// Health below one, or the bucket is past its delisting deadline
    RiskyPosition,
    /// Bucket delisting deadline passed
    BucketDelisted,
    /// A registered close condition fired
    LimitConditions,
    BatchLiquidation,
    BatchStopLoss,
    BatchTakeProfit,
    BatchDelisting,
}

impl CloseReason {
    /// Liquidations send the remainder to the treasury and charge no fee.
    pub fn is_liquidation(&self) -> bool {
        matches!(self, Self::RiskyPosition | Self::BatchLiquidation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ProtocolEvent {
    OpenPosition {
        position_id: u64,
        trader: Address,
        bucket: Option<Address>,
        position_asset: Address,
        sold_asset: Address,
        position_amount: U256,
        deposit_amount_in_sold_asset: U256,
        borrowed_amount: U256,
        open_borrow_index: U256,
    },
    ClosePosition {
        position_id: u64,
        trader: Address,
        closed_by: Address,
        bucket: Option<Address>,
        sold_asset: Address,
        amount_out: U256,
        debt: U256,
        profit: I256,
        reason: CloseReason,
    },
    PartialClosePosition {
        position_id: u64,
        trader: Address,
        amount: U256,
        amount_out: U256,
        deposit_decrease: U256,
        debt_repaid: U256,
        profit: I256,
    },
    PaidProtocolFee {
        position_id: u64,
        trader: Address,
        payment_asset: Address,
        fee_rate_type: FeeRateType,
        fee_in_payment_asset: U256,
        fee_in_discount_token: U256,
    },
    IncreaseDeposit {
        position_id: u64,
        trader: Address,
        amount_in_sold_asset: U256,
        debt_repaid: U256,
    },
    DecreaseDeposit {
        position_id: u64,
        trader: Address,
        amount: U256,
    },
    UpdatePositionConditions {
        position_id: u64,
        trader: Address,
        conditions: usize,
    },
    // Bucket lifecycle
    Deposit {
        bucket: Address,
        lender: Address,
        amount: U256,
        scaled: U256,
    },
    Withdraw {
        bucket: Address,
        lender: Address,
        amount: U256,
        paid_out: U256,
    },
    Borrow {
        bucket: Address,
        trader: Address,
        amount: U256,
        scaled: U256,
    },
    Repay {
        bucket: Address,
        trader: Address,
        amount: U256,
        scaled: U256,
    },
    PermanentLoss {
        bucket: Address,
        shortfall: U256,
        permanent_loss_scaled: U256,
    },
    IndexesUpdated {
        bucket: Address,
        liquidity_index: U256,
        variable_borrow_index: U256,
        bar: U256,
        lar: U256,
        timestamp: u64,
    },
    Delisted {
        bucket: Address,
        deadline: u64,
    },
}

/// Append-only committed event history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLog {
    events: Vec<ProtocolEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: ProtocolEvent) {
        self.events.push(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = ProtocolEvent>) {
        self.events.extend(events);
    }

    pub fn events(&self) -> &[ProtocolEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Close events, in commit order.
    pub fn closes(&self) -> impl Iterator<Item = &ProtocolEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e, ProtocolEvent::ClosePosition { .. }))
    }

    /// Events as JSON lines.
    pub fn to_json_lines(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        for event in &self.events {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_filter_and_json() {
        let mut log = EventLog::new();
        log.push(ProtocolEvent::Delisted {
            bucket: Address::ZERO,
            deadline: 10,
        });
        log.push(ProtocolEvent::ClosePosition {
            position_id: 1,
            trader: Address::ZERO,
            closed_by: Address::ZERO,
            bucket: None,
            sold_asset: Address::ZERO,
            amount_out: U256::from(1u64),
            debt: U256::ZERO,
            profit: I256::ZERO,
            reason: CloseReason::ClosedByTrader,
        });
        assert_eq!(log.closes().count(), 1);

        let json = log.to_json_lines().unwrap();
        assert_eq!(json.lines().count(), 2);
        assert!(json.contains("\"event\":\"Delisted\""));
    }

    #[test]
    fn test_reason_classes() {
        assert!(CloseReason::BatchLiquidation.is_liquidation());
        assert!(!CloseReason::BucketDelisted.is_liquidation());
    }
}
