//! Batch close of homogeneous positions against one aggregate swap.
//!
//! All positions share the bucket, position asset and sold asset. The sum
//! of their position amounts is swapped once, and the output is pro-rated
//! by position amount and settled per position exactly as a single close
//! would be. Rounding residue goes to the treasury. A single invalid id
//! reverts the whole batch.

use alloy::primitives::{Address, U256};
use margin_chain::{BalanceVault, KeeperActionType, KeeperRewardParams, OracleData};
use margin_dex::RouteNode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, instrument};

use crate::conditions::TriggerLeg;
use crate::error::{MarginError, MarginResult};
use crate::events::{CloseReason, ProtocolEvent};
use crate::fees::FeeRateType;
use crate::position::{self, Position};
use crate::protocol::{CallContext, MarginProtocol, Txn};
use crate::settlement::{self, CloseOutcome, Remainder};
use crate::u256_math;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseBatchParams {
    pub ids: Vec<u64>,
    /// Position asset to sold asset
    pub routes: RouteNode,
    pub position_asset: Address,
    pub sold_asset: Address,
    /// `None` for a batch of spot positions
    pub bucket: Option<Address>,
    /// One per id, for the stop-loss and take-profit reasons
    #[serde(default)]
    pub condition_indexes: Vec<usize>,
    pub reason: CloseReason,
    #[serde(default)]
    pub oracle_data: OracleData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Aggregate swap output
    pub amount_out: U256,
    pub closed: Vec<(u64, CloseOutcome)>,
    /// Unallocated rounding residue credited to the treasury
    pub residual: U256,
}

impl<V: BalanceVault + Clone> MarginProtocol<V> {
    #[instrument(skip(self, ctx, params), fields(keeper = %ctx.sender, count = params.ids.len(), reason = ?params.reason))]
    pub fn close_batch(
        &mut self,
        ctx: CallContext,
        params: &CloseBatchParams,
    ) -> MarginResult<BatchOutcome> {
        self.atomically(ctx, |txn| txn.close_batch(params))
    }
}

impl<V: BalanceVault> Txn<'_, V> {
    fn close_batch(&mut self, p: &CloseBatchParams) -> MarginResult<BatchOutcome> {
        self.enter(None, &p.oracle_data)?;
        let (action, leg) = match p.reason {
            CloseReason::BatchLiquidation => (KeeperActionType::Liquidation, None),
            CloseReason::BatchStopLoss => (KeeperActionType::StopLoss, Some(TriggerLeg::StopLoss)),
            CloseReason::BatchTakeProfit => {
                (KeeperActionType::TakeProfit, Some(TriggerLeg::TakeProfit))
            }
            CloseReason::BatchDelisting => (KeeperActionType::BucketDelisted, None),
            other => return Err(MarginError::UnsupportedCloseReason(other)),
        };

        let positions = self.batch_positions(p)?;
        if leg.is_some() && p.condition_indexes.len() != p.ids.len() {
            return Err(MarginError::ConditionIndexesMismatch {
                ids: p.ids.len(),
                indexes: p.condition_indexes.len(),
            });
        }

        let vbi = match p.bucket {
            Some(address) => self.accrue(address)?,
            None => U256::ZERO,
        };
        self.check_batch_eligibility(p, &positions)?;

        let amounts: Vec<U256> = positions.iter().map(|pos| pos.position_amount).collect();
        let total = amounts
            .iter()
            .try_fold(U256::ZERO, |acc, a| u256_math::add(acc, *a))?;
        let amount_out = self.swap(&p.routes, p.position_asset, p.sold_asset, total, U256::ZERO)?;

        if let Some(leg) = leg {
            for (pos, index) in positions.iter().zip(&p.condition_indexes) {
                self.check_condition(pos, *index, leg, total, amount_out)?;
            }
        }

        let allocations = settlement::pro_rata(&amounts, amount_out)?;
        let treasury = self.treasury();
        let mut burns = Vec::with_capacity(positions.len());
        let mut repaid = U256::ZERO;
        let mut shortfall = U256::ZERO;
        let mut allocated = U256::ZERO;
        let mut closed = Vec::with_capacity(positions.len());

        for (pos, out) in positions.iter().zip(allocations) {
            let debt = pos.debt(vbi)?;
            let (fee, remainder) = if p.reason.is_liquidation() {
                (U256::ZERO, Remainder::Treasury)
            } else {
                let rate_type = FeeRateType::for_close(!pos.is_spot(), true);
                let fee = self.charge_fee(pos, rate_type, p.sold_asset, out, out.saturating_sub(debt))?;
                (fee, Remainder::Trader)
            };
            let outcome =
                settlement::settle(out, debt, pos.deposit_amount_in_sold_asset, fee, remainder)?;

            if !pos.is_spot() {
                burns.push((pos.trader, pos.scaled_debt_amount));
            }
            repaid = u256_math::add(repaid, outcome.repaid)?;
            shortfall = u256_math::add(shortfall, outcome.shortfall)?;
            allocated = u256_math::add(allocated, out)?;

            self.state.vault.credit(pos.trader, p.sold_asset, outcome.to_trader);
            self.state.vault.credit(treasury, p.sold_asset, outcome.to_treasury);
            self.state.positions.remove(pos.id)?;
            self.emit(ProtocolEvent::ClosePosition {
                position_id: pos.id,
                trader: pos.trader,
                closed_by: self.sender(),
                bucket: pos.bucket,
                sold_asset: p.sold_asset,
                amount_out: out,
                debt,
                profit: outcome.profit,
                reason: p.reason,
            });
            closed.push((pos.id, outcome));
        }

        if let Some(address) = p.bucket {
            let now = self.now();
            let (bucket, events) = self.bucket_and_events(address)?;
            bucket.batch_repay(&burns, repaid, shortfall, now, events)?;
        }

        let residual = u256_math::sub(amount_out, allocated)?;
        self.state.vault.credit(treasury, p.sold_asset, residual);

        let keeper = self.sender();
        self.report_reward(KeeperRewardParams {
            keeper,
            action,
            number_of_actions: u32::try_from(positions.len()).unwrap_or(u32::MAX),
            position_amount: total,
            payment_asset: p.sold_asset,
            amount_out,
        });

        info!(
            count = positions.len(),
            %total,
            %amount_out,
            %repaid,
            %shortfall,
            %residual,
            "Batch closed"
        );
        Ok(BatchOutcome {
            amount_out,
            closed,
            residual,
        })
    }

    /// Resolve ids into positions, checking they line up with the batch.
    fn batch_positions(&self, p: &CloseBatchParams) -> MarginResult<Vec<Position>> {
        if p.ids.is_empty() {
            return Err(MarginError::EmptyIds);
        }
        let mut seen = HashSet::with_capacity(p.ids.len());
        for id in &p.ids {
            if !seen.insert(*id) {
                return Err(MarginError::DuplicatePositionId(*id));
            }
        }
        if let Some(address) = p.bucket {
            let bucket_asset = self.bucket(address)?.asset();
            if bucket_asset != p.sold_asset {
                return Err(MarginError::SoldAssetMismatch {
                    sold_asset: p.sold_asset,
                    bucket_asset,
                });
            }
        }

        p.ids
            .iter()
            .map(|id| {
                let pos = self.state.positions.get(*id)?;
                if pos.bucket != p.bucket {
                    return Err(MarginError::BucketMismatch { id: *id });
                }
                if pos.position_asset != p.position_asset || pos.sold_asset != p.sold_asset {
                    return Err(MarginError::AssetMismatch { id: *id });
                }
                Ok(pos.clone())
            })
            .collect()
    }

    /// Pre-swap eligibility: risky or past the delisting deadline for
    /// liquidation, deadline passed for delisting. Condition reasons are
    /// checked after the swap.
    fn check_batch_eligibility(&self, p: &CloseBatchParams, positions: &[Position]) -> MarginResult<()> {
        let not_eligible = |id: u64| MarginError::PositionNotEligible {
            id,
            reason: p.reason,
        };
        match p.reason {
            CloseReason::BatchLiquidation => {
                let Some(address) = p.bucket else {
                    return Err(not_eligible(positions[0].id));
                };
                if self.bucket(address)?.is_delisting_deadline_passed(self.now()) {
                    return Ok(());
                }
                for pos in positions {
                    if !position::is_risky(self.health(pos)?) {
                        return Err(not_eligible(pos.id));
                    }
                }
                Ok(())
            }
            CloseReason::BatchDelisting => {
                let passed = match p.bucket {
                    Some(address) => self.bucket(address)?.is_delisting_deadline_passed(self.now()),
                    None => false,
                };
                if passed {
                    Ok(())
                } else {
                    Err(not_eligible(positions[0].id))
                }
            }
            _ => Ok(()),
        }
    }
}
