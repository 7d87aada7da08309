//! Position lifecycle entry points.
//!
//! Open, close (by trader or by keeper), partial close, deposit
//! adjustments and close-condition updates. Every entry point runs inside
//! a single all-or-nothing call: bucket accrual comes first, the router
//! swap is checked against the oracle, and bucket and vault effects are
//! applied to the draft state only.

use alloy::primitives::{Address, U256};
use margin_chain::{BalanceVault, KeeperActionType, KeeperRewardParams, OracleData};
use margin_dex::{DexError, RouteError, RouteNode};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info, instrument};

use crate::conditions::{ConditionContext, ConditionKind, CloseCondition, TriggerLeg};
use crate::error::{MarginError, MarginResult};
use crate::events::{CloseReason, ProtocolEvent};
use crate::fees::FeeRateType;
use crate::position::{self, Position};
use crate::protocol::{CallContext, MarginProtocol, Txn};
use crate::settlement::{self, CloseOutcome, Remainder};
use crate::u256_math::{self, Rounding, WAD};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPositionParams {
    /// `None` opens a spot position
    pub bucket: Option<Address>,
    pub position_asset: Address,
    pub sold_asset: Address,
    /// Sold asset, position asset or any asset reachable through
    /// `deposit_routes`
    pub deposit_asset: Address,
    pub deposit_amount: U256,
    pub borrowed_amount: U256,
    /// Funds come from the wallet rather than the vault's available balance
    pub is_deposit_from_wallet: bool,
    /// Sold asset to position asset
    pub routes: RouteNode,
    /// Deposit asset to sold asset, for third-asset deposits
    #[serde(default)]
    pub deposit_routes: Option<RouteNode>,
    /// Minimum resulting position amount
    pub amount_out_min: U256,
    #[serde(default)]
    pub close_conditions: Vec<CloseCondition>,
    #[serde(default)]
    pub fee_in_discount_token: bool,
    pub deadline: u64,
    #[serde(default)]
    pub oracle_data: OracleData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosePositionParams {
    pub id: u64,
    pub receiver: Address,
    pub routes: RouteNode,
    pub amount_out_min: U256,
    pub deadline: u64,
    #[serde(default)]
    pub oracle_data: OracleData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseByConditionParams {
    pub id: u64,
    pub routes: RouteNode,
    /// Index into the position's close conditions, for
    /// [`CloseReason::LimitConditions`]
    #[serde(default)]
    pub condition_index: usize,
    pub reason: CloseReason,
    #[serde(default)]
    pub oracle_data: OracleData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialCloseParams {
    pub id: u64,
    /// Position asset to sell, strictly below the position amount
    pub amount: U256,
    pub receiver: Address,
    pub routes: RouteNode,
    pub amount_out_min: U256,
    pub deadline: u64,
    #[serde(default)]
    pub oracle_data: OracleData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncreaseDepositParams {
    pub id: u64,
    pub amount: U256,
    pub asset: Address,
    pub from_wallet: bool,
    /// Required when `asset` is not the sold asset
    #[serde(default)]
    pub routes: Option<RouteNode>,
    pub amount_out_min: U256,
    pub deadline: u64,
    #[serde(default)]
    pub oracle_data: OracleData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecreaseDepositParams {
    pub id: u64,
    pub amount: U256,
    pub deadline: u64,
    #[serde(default)]
    pub oracle_data: OracleData,
}

impl<V: BalanceVault + Clone> MarginProtocol<V> {
    /// Open a position; returns its id.
    #[instrument(skip(self, ctx, params), fields(trader = %ctx.sender, bucket = ?params.bucket))]
    pub fn open_position(&mut self, ctx: CallContext, params: &OpenPositionParams) -> MarginResult<u64> {
        self.atomically(ctx, |txn| txn.open(params))
    }

    /// Close the caller's position in full.
    #[instrument(skip(self, ctx, params), fields(trader = %ctx.sender, id = params.id))]
    pub fn close_position(
        &mut self,
        ctx: CallContext,
        params: &ClosePositionParams,
    ) -> MarginResult<CloseOutcome> {
        self.atomically(ctx, |txn| txn.close(params))
    }

    /// Keeper close of a risky, delisted or condition-triggered position.
    #[instrument(skip(self, ctx, params), fields(keeper = %ctx.sender, id = params.id, reason = ?params.reason))]
    pub fn close_position_by_condition(
        &mut self,
        ctx: CallContext,
        params: &CloseByConditionParams,
    ) -> MarginResult<CloseOutcome> {
        self.atomically(ctx, |txn| txn.close_by_condition(params))
    }

    #[instrument(skip(self, ctx, params), fields(trader = %ctx.sender, id = params.id))]
    pub fn partial_close_position(
        &mut self,
        ctx: CallContext,
        params: &PartialCloseParams,
    ) -> MarginResult<CloseOutcome> {
        self.atomically(ctx, |txn| txn.partial_close(params))
    }

    /// Add collateral; it repays debt first and any excess returns to the
    /// trader's vault balance. Returns the debt repaid.
    #[instrument(skip(self, ctx, params), fields(trader = %ctx.sender, id = params.id))]
    pub fn increase_deposit(
        &mut self,
        ctx: CallContext,
        params: &IncreaseDepositParams,
    ) -> MarginResult<U256> {
        self.atomically(ctx, |txn| txn.increase_deposit(params))
    }

    /// Withdraw part of the deposit to the vault by borrowing more.
    #[instrument(skip(self, ctx, params), fields(trader = %ctx.sender, id = params.id))]
    pub fn decrease_deposit(
        &mut self,
        ctx: CallContext,
        params: &DecreaseDepositParams,
    ) -> MarginResult<()> {
        self.atomically(ctx, |txn| txn.decrease_deposit(params))
    }

    #[instrument(skip(self, ctx, conditions), fields(trader = %ctx.sender))]
    pub fn update_position_conditions(
        &mut self,
        ctx: CallContext,
        id: u64,
        conditions: Vec<CloseCondition>,
    ) -> MarginResult<()> {
        self.atomically(ctx, |txn| txn.update_conditions(id, conditions))
    }
}

impl<V: BalanceVault> Txn<'_, V> {
    fn owned_position(&self, id: u64) -> MarginResult<Position> {
        let position = self.state.positions.get(id)?;
        if position.trader != self.sender() {
            return Err(MarginError::CallerIsNotTrader {
                id,
                caller: self.sender(),
            });
        }
        Ok(position.clone())
    }

    fn open(&mut self, p: &OpenPositionParams) -> MarginResult<u64> {
        self.enter(Some(p.deadline), &p.oracle_data)?;
        if p.deposit_amount.is_zero() {
            return Err(MarginError::ZeroAmount);
        }
        for condition in &p.close_conditions {
            self.conditions.validate_params(condition)?;
        }
        match p.bucket {
            None if !p.borrowed_amount.is_zero() => return Err(MarginError::SpotBorrow),
            None => {}
            Some(address) => {
                let bucket = self.bucket(address)?;
                if bucket.asset() != p.sold_asset {
                    return Err(MarginError::SoldAssetMismatch {
                        sold_asset: p.sold_asset,
                        bucket_asset: bucket.asset(),
                    });
                }
                if bucket.is_delisted() {
                    return Err(MarginError::BucketDelisted(address));
                }
                if !bucket.is_asset_allowed(p.position_asset) {
                    return Err(MarginError::AssetNotAllowed {
                        bucket: address,
                        asset: p.position_asset,
                    });
                }
            }
        }

        let trader = self.sender();
        if !p.is_deposit_from_wallet {
            self.state
                .vault
                .debit_available(trader, p.deposit_asset, p.deposit_amount)?;
        }

        // Deposit valued in the sold asset; a position-asset deposit is
        // kept as is and only the borrowed part is swapped.
        let (deposit_in_sold, deposit_in_position) = if p.deposit_asset == p.sold_asset {
            (p.deposit_amount, U256::ZERO)
        } else if p.deposit_asset == p.position_asset {
            let rate = self.oracle().rate(p.position_asset, p.sold_asset)?;
            (
                u256_math::wad_mul(p.deposit_amount, rate, Rounding::Down)?,
                p.deposit_amount,
            )
        } else {
            let route = p
                .deposit_routes
                .as_ref()
                .ok_or(MarginError::InvalidRoute(RouteError::Empty))?;
            let converted =
                self.swap(route, p.deposit_asset, p.sold_asset, p.deposit_amount, U256::ZERO)?;
            (converted, U256::ZERO)
        };
        if deposit_in_sold.is_zero() {
            return Err(MarginError::ZeroAmount);
        }

        let notional = u256_math::add(deposit_in_sold, p.borrowed_amount)?;
        self.check_size(p.sold_asset, notional)?;

        let mut scaled_debt = U256::ZERO;
        let mut open_borrow_index = U256::ZERO;
        if let Some(address) = p.bucket {
            let leverage = u256_math::wad_div(notional, deposit_in_sold, Rounding::Down)?;
            let max = self.max_leverage(address, p.position_asset, p.sold_asset)?;
            if leverage > max {
                return Err(MarginError::LeverageExceeded { leverage, max });
            }
            open_borrow_index = self.accrue(address)?;
            if !p.borrowed_amount.is_zero() {
                let now = self.now();
                let (bucket, events) = self.bucket_and_events(address)?;
                scaled_debt = bucket.borrow(trader, p.position_asset, p.borrowed_amount, now, events)?;
                open_borrow_index = bucket.variable_borrow_index;
            }
        }

        let to_swap = if deposit_in_position.is_zero() {
            notional
        } else {
            p.borrowed_amount
        };
        let bought = self.swap(
            &p.routes,
            p.sold_asset,
            p.position_asset,
            to_swap,
            p.amount_out_min.saturating_sub(deposit_in_position),
        )?;
        let position_amount = u256_math::add(bought, deposit_in_position)?;
        if position_amount < p.amount_out_min {
            return Err(MarginError::Dex(DexError::SlippageExceeded {
                amount_out: position_amount,
                min_out: p.amount_out_min,
            }));
        }

        let id = self.state.positions.next_id();
        let position = Position {
            id,
            trader,
            bucket: p.bucket,
            position_asset: p.position_asset,
            sold_asset: p.sold_asset,
            position_amount,
            deposit_amount_in_sold_asset: deposit_in_sold,
            scaled_debt_amount: scaled_debt,
            open_borrow_index,
            created_at: self.now(),
            updated_conditions_at: self.now(),
            close_conditions: p.close_conditions.iter().cloned().collect(),
            fee_in_discount_token: p.fee_in_discount_token,
        };

        if !position.is_spot() {
            let health = self.health(&position)?;
            let required = u256_math::add(
                WAD,
                u256_math::bps_to_wad(self.config.position.maintenance_buffer_bps),
            )?;
            if health < required {
                return Err(MarginError::InsufficientHealth { health, required });
            }
        }

        info!(
            id,
            %trader,
            %position_amount,
            deposit = %deposit_in_sold,
            borrowed = %p.borrowed_amount,
            "Position opened"
        );
        self.emit(ProtocolEvent::OpenPosition {
            position_id: id,
            trader,
            bucket: p.bucket,
            position_asset: p.position_asset,
            sold_asset: p.sold_asset,
            position_amount,
            deposit_amount_in_sold_asset: deposit_in_sold,
            borrowed_amount: p.borrowed_amount,
            open_borrow_index,
        });
        self.state.positions.insert(position);
        Ok(id)
    }

    /// Leverage cap of the bucket for the pair.
    pub(crate) fn max_leverage(
        &self,
        bucket: Address,
        position_asset: Address,
        sold_asset: Address,
    ) -> MarginResult<U256> {
        let cfg = &self.config.position;
        let tolerance = self.markets.oracle_tolerable_limit(
            position_asset,
            sold_asset,
            u256_math::bps_to_wad(cfg.default_oracle_tolerable_limit_bps),
        );
        self.bucket(bucket)?.max_asset_leverage(
            u256_math::bps_to_wad(cfg.security_buffer_bps),
            tolerance,
            self.oracle().pair_price_drop(position_asset, sold_asset),
            u256_math::bps_to_wad(cfg.maintenance_buffer_bps),
        )
    }

    fn close(&mut self, p: &ClosePositionParams) -> MarginResult<CloseOutcome> {
        self.enter(Some(p.deadline), &p.oracle_data)?;
        let position = self.owned_position(p.id)?;
        let (outcome, _) = self.close_single(
            position,
            &p.routes,
            p.amount_out_min,
            CloseReason::ClosedByTrader,
            p.receiver,
            None,
        )?;
        Ok(outcome)
    }

    fn close_by_condition(&mut self, p: &CloseByConditionParams) -> MarginResult<CloseOutcome> {
        self.enter(None, &p.oracle_data)?;
        let position = self.state.positions.get(p.id)?.clone();
        let not_eligible = MarginError::PositionNotEligible {
            id: p.id,
            reason: p.reason,
        };

        let mut condition_index = None;
        match p.reason {
            CloseReason::RiskyPosition => {
                let address = position.bucket.ok_or(not_eligible.clone())?;
                self.accrue(address)?;
                let health = self.health(&position)?;
                debug!(id = p.id, health = u256_math::wad_to_f64(health), "Liquidation health");
                let expired = self.bucket(address)?.is_delisting_deadline_passed(self.now());
                if !position::is_risky(health) && !expired {
                    return Err(not_eligible);
                }
            }
            CloseReason::BucketDelisted => {
                let address = position.bucket.ok_or(not_eligible.clone())?;
                if !self.bucket(address)?.is_delisting_deadline_passed(self.now()) {
                    return Err(not_eligible);
                }
            }
            CloseReason::LimitConditions => {
                let len = position.close_conditions.len();
                if p.condition_index >= len {
                    return Err(MarginError::ConditionIndexOutOfRange {
                        index: p.condition_index,
                        len,
                    });
                }
                condition_index = Some(p.condition_index);
            }
            other => return Err(MarginError::UnsupportedCloseReason(other)),
        }

        let trader = position.trader;
        let position_amount = position.position_amount;
        let sold_asset = position.sold_asset;
        let (outcome, condition_action) = self.close_single(
            position,
            &p.routes,
            U256::ZERO,
            p.reason,
            trader,
            condition_index,
        )?;

        let action = match p.reason {
            CloseReason::RiskyPosition => KeeperActionType::Liquidation,
            CloseReason::BucketDelisted => KeeperActionType::BucketDelisted,
            _ => condition_action.unwrap_or(KeeperActionType::LimitPrice),
        };
        let keeper = self.sender();
        self.report_reward(KeeperRewardParams {
            keeper,
            action,
            number_of_actions: 1,
            position_amount,
            payment_asset: sold_asset,
            amount_out: outcome.amount_out,
        });
        Ok(outcome)
    }

    /// Swap a whole position back to the sold asset and settle it.
    fn close_single(
        &mut self,
        position: Position,
        route: &RouteNode,
        min_out: U256,
        reason: CloseReason,
        receiver: Address,
        condition_index: Option<usize>,
    ) -> MarginResult<(CloseOutcome, Option<KeeperActionType>)> {
        let debt = match position.bucket {
            Some(address) => {
                let vbi = self.accrue(address)?;
                position.debt(vbi)?
            }
            None => U256::ZERO,
        };

        let amount_out = self.swap(
            route,
            position.position_asset,
            position.sold_asset,
            position.position_amount,
            min_out,
        )?;

        let action = match condition_index {
            Some(index) => Some(self.check_condition(
                &position,
                index,
                TriggerLeg::Any,
                position.position_amount,
                amount_out,
            )?),
            None => None,
        };

        if reason == CloseReason::ClosedByTrader && amount_out < debt {
            return Err(MarginError::ProceedsBelowDebt { amount_out, debt });
        }

        let left = amount_out.saturating_sub(debt);
        let (fee, remainder) = if reason.is_liquidation() {
            (U256::ZERO, Remainder::Treasury)
        } else {
            let rate_type =
                FeeRateType::for_close(!position.is_spot(), reason != CloseReason::ClosedByTrader);
            let fee = self.charge_fee(&position, rate_type, position.sold_asset, amount_out, left)?;
            (fee, Remainder::Trader)
        };
        let outcome = settlement::settle(
            amount_out,
            debt,
            position.deposit_amount_in_sold_asset,
            fee,
            remainder,
        )?;

        if let Some(address) = position.bucket {
            let now = self.now();
            let (bucket, events) = self.bucket_and_events(address)?;
            bucket.repay_scaled(
                position.trader,
                position.scaled_debt_amount,
                outcome.repaid,
                now,
                events,
            )?;
            if !outcome.shortfall.is_zero() {
                bucket.register_permanent_loss(outcome.shortfall, events)?;
            }
        }

        let treasury = self.treasury();
        self.state
            .vault
            .credit(receiver, position.sold_asset, outcome.to_trader);
        self.state
            .vault
            .credit(treasury, position.sold_asset, outcome.to_treasury);
        self.state.positions.remove(position.id)?;

        info!(
            id = position.id,
            ?reason,
            %amount_out,
            %debt,
            profit = %outcome.profit,
            "Position closed"
        );
        self.emit(ProtocolEvent::ClosePosition {
            position_id: position.id,
            trader: position.trader,
            closed_by: self.sender(),
            bucket: position.bucket,
            sold_asset: position.sold_asset,
            amount_out,
            debt,
            profit: outcome.profit,
            reason,
        });
        Ok((outcome, action))
    }

    /// Evaluate condition `index` of `position` against a realised swap,
    /// returning the keeper action it corresponds to.
    pub(crate) fn check_condition(
        &self,
        position: &Position,
        index: usize,
        leg: TriggerLeg,
        amount_in: U256,
        amount_out: U256,
    ) -> MarginResult<KeeperActionType> {
        let condition = position.close_conditions.get(index).ok_or(
            MarginError::ConditionIndexOutOfRange {
                index,
                len: position.close_conditions.len(),
            },
        )?;
        let oracle_price = self
            .oracle()
            .rate(position.position_asset, position.sold_asset)?;
        let exit_price = u256_math::wad_div(amount_out, amount_in, Rounding::Down)?;
        let ctx = ConditionContext {
            oracle_price,
            exit_price,
            leg,
        };
        if !self.conditions.is_met(condition, &ctx)? {
            return Err(MarginError::ConditionNotMet {
                id: position.id,
                index,
            });
        }
        debug!(id = position.id, index, %oracle_price, %exit_price, "Close condition met");

        Ok(match (condition.kind, leg) {
            (ConditionKind::LimitPrice, _) => KeeperActionType::LimitPrice,
            (ConditionKind::TakeProfitStopLoss, TriggerLeg::StopLoss) => KeeperActionType::StopLoss,
            (ConditionKind::TakeProfitStopLoss, TriggerLeg::TakeProfit) => {
                KeeperActionType::TakeProfit
            }
            (ConditionKind::TakeProfitStopLoss, TriggerLeg::Any) => {
                let stop_loss = ConditionContext {
                    leg: TriggerLeg::StopLoss,
                    ..ctx
                };
                if self.conditions.is_met(condition, &stop_loss)? {
                    KeeperActionType::StopLoss
                } else {
                    KeeperActionType::TakeProfit
                }
            }
        })
    }

    fn partial_close(&mut self, p: &PartialCloseParams) -> MarginResult<CloseOutcome> {
        self.enter(Some(p.deadline), &p.oracle_data)?;
        let position = self.owned_position(p.id)?;
        if p.amount.is_zero() {
            return Err(MarginError::ZeroAmount);
        }
        if p.amount >= position.position_amount {
            return Err(MarginError::AmountNotBelowPosition {
                amount: p.amount,
                position_amount: position.position_amount,
            });
        }

        let percent = u256_math::wad_div(p.amount, position.position_amount, Rounding::Down)?;
        let deposit_decrease = u256_math::wad_mul(
            position.deposit_amount_in_sold_asset,
            percent,
            Rounding::Down,
        )?;
        let scaled_decrease =
            u256_math::wad_mul(position.scaled_debt_amount, percent, Rounding::Down)?;
        let debt_part = match position.bucket {
            Some(address) => {
                let vbi = self.accrue(address)?;
                u256_math::ray_mul(scaled_decrease, vbi, Rounding::Down)?
            }
            None => U256::ZERO,
        };

        let amount_out = self.swap(
            &p.routes,
            position.position_asset,
            position.sold_asset,
            p.amount,
            p.amount_out_min,
        )?;
        if amount_out < debt_part {
            return Err(MarginError::ProceedsBelowDebt {
                amount_out,
                debt: debt_part,
            });
        }

        let remaining = position.position_amount - p.amount;
        self.check_size(position.position_asset, remaining)?;

        let rate_type = FeeRateType::for_close(!position.is_spot(), false);
        let fee = self.charge_fee(
            &position,
            rate_type,
            position.sold_asset,
            amount_out,
            amount_out - debt_part,
        )?;
        let outcome = settlement::settle(
            amount_out,
            debt_part,
            deposit_decrease,
            fee,
            Remainder::Trader,
        )?;

        if let Some(address) = position.bucket {
            let now = self.now();
            let (bucket, events) = self.bucket_and_events(address)?;
            bucket.repay_scaled(position.trader, scaled_decrease, debt_part, now, events)?;
        }
        self.state
            .vault
            .credit(p.receiver, position.sold_asset, outcome.to_trader);

        let stored = self.state.positions.get_mut(p.id)?;
        stored.position_amount = remaining;
        stored.deposit_amount_in_sold_asset -= deposit_decrease;
        stored.scaled_debt_amount -= scaled_decrease;

        info!(id = p.id, amount = %p.amount, %amount_out, %remaining, "Position partially closed");
        self.emit(ProtocolEvent::PartialClosePosition {
            position_id: p.id,
            trader: position.trader,
            amount: p.amount,
            amount_out,
            deposit_decrease,
            debt_repaid: debt_part,
            profit: outcome.profit,
        });
        Ok(outcome)
    }

    fn increase_deposit(&mut self, p: &IncreaseDepositParams) -> MarginResult<U256> {
        self.enter(Some(p.deadline), &p.oracle_data)?;
        let position = self.owned_position(p.id)?;
        let address = position.bucket.ok_or(MarginError::NotMarginPosition(p.id))?;
        if p.amount.is_zero() {
            return Err(MarginError::ZeroAmount);
        }

        let trader = position.trader;
        if !p.from_wallet {
            self.state.vault.debit_available(trader, p.asset, p.amount)?;
        }
        let amount_in_sold = if p.asset == position.sold_asset {
            p.amount
        } else {
            let route = p
                .routes
                .as_ref()
                .ok_or(MarginError::InvalidRoute(RouteError::Empty))?;
            self.swap(route, p.asset, position.sold_asset, p.amount, p.amount_out_min)?
        };

        let vbi = self.accrue(address)?;
        let debt = position.debt(vbi)?;
        let repay = amount_in_sold.min(debt);
        let scaled_burn = if repay == debt {
            position.scaled_debt_amount
        } else {
            u256_math::ray_div(repay, vbi, Rounding::Down)?
        };
        if !repay.is_zero() {
            let now = self.now();
            let (bucket, events) = self.bucket_and_events(address)?;
            bucket.repay_scaled(trader, scaled_burn, repay, now, events)?;
        }
        self.state
            .vault
            .credit(trader, position.sold_asset, amount_in_sold - repay);

        let stored = self.state.positions.get_mut(p.id)?;
        stored.scaled_debt_amount -= scaled_burn;
        stored.deposit_amount_in_sold_asset =
            u256_math::add(stored.deposit_amount_in_sold_asset, repay)?;

        debug!(id = p.id, %amount_in_sold, %repay, "Deposit increased");
        self.emit(ProtocolEvent::IncreaseDeposit {
            position_id: p.id,
            trader,
            amount_in_sold_asset: amount_in_sold,
            debt_repaid: repay,
        });
        Ok(repay)
    }

    fn decrease_deposit(&mut self, p: &DecreaseDepositParams) -> MarginResult<()> {
        self.enter(Some(p.deadline), &p.oracle_data)?;
        let position = self.owned_position(p.id)?;
        let address = position.bucket.ok_or(MarginError::NotMarginPosition(p.id))?;
        if p.amount.is_zero() {
            return Err(MarginError::ZeroAmount);
        }
        if p.amount >= position.deposit_amount_in_sold_asset {
            return Err(MarginError::DecreaseNotBelowDeposit {
                amount: p.amount,
                deposit: position.deposit_amount_in_sold_asset,
            });
        }

        let now = self.now();
        let trader = position.trader;
        let (bucket, events) = self.bucket_and_events(address)?;
        let scaled = bucket.borrow(trader, position.position_asset, p.amount, now, events)?;
        self.state.vault.credit(trader, position.sold_asset, p.amount);

        let stored = self.state.positions.get_mut(p.id)?;
        stored.scaled_debt_amount = u256_math::add(stored.scaled_debt_amount, scaled)?;
        stored.deposit_amount_in_sold_asset -= p.amount;
        let updated = stored.clone();

        let health = self.health(&updated)?;
        let required = u256_math::add(
            WAD,
            u256_math::bps_to_wad(self.config.position.maintenance_buffer_bps),
        )?;
        if health < required {
            return Err(MarginError::InsufficientHealth { health, required });
        }

        debug!(id = p.id, amount = %p.amount, %health, "Deposit decreased");
        self.emit(ProtocolEvent::DecreaseDeposit {
            position_id: p.id,
            trader,
            amount: p.amount,
        });
        Ok(())
    }

    fn update_conditions(&mut self, id: u64, conditions: Vec<CloseCondition>) -> MarginResult<()> {
        self.ensure_not_blacklisted()?;
        self.owned_position(id)?;
        for condition in &conditions {
            self.conditions.validate_params(condition)?;
        }
        let now = self.now();
        let count = conditions.len();
        let stored = self.state.positions.get_mut(id)?;
        stored.close_conditions = SmallVec::from_vec(conditions);
        stored.updated_conditions_at = now;
        let trader = stored.trader;

        self.emit(ProtocolEvent::UpdatePositionConditions {
            position_id: id,
            trader,
            conditions: count,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testkit::*;
    use margin_chain::{BalanceVault, OracleData};

    fn open_params(deposit: U256, borrowed: U256) -> OpenPositionParams {
        OpenPositionParams {
            bucket: Some(bucket_address()),
            position_asset: weth(),
            sold_asset: usdc(),
            deposit_asset: usdc(),
            deposit_amount: deposit,
            borrowed_amount: borrowed,
            is_deposit_from_wallet: true,
            routes: buy_route(),
            deposit_routes: None,
            amount_out_min: U256::ZERO,
            close_conditions: Vec::new(),
            fee_in_discount_token: false,
            deadline: u64::MAX,
            oracle_data: OracleData::none(),
        }
    }

    fn close_params(id: u64) -> ClosePositionParams {
        ClosePositionParams {
            id,
            receiver: trader(),
            routes: sell_route(),
            amount_out_min: U256::ZERO,
            deadline: u64::MAX,
            oracle_data: OracleData::none(),
        }
    }

    fn ctx(sender: Address) -> CallContext {
        CallContext::new(sender, 0)
    }

    #[test]
    fn test_open_records_position() {
        let mut fx = Fixture::new();
        let id = fx
            .protocol
            .open_position(ctx(trader()), &open_params(wad(20), wad(20)))
            .unwrap();

        let position = fx.protocol.position(id).unwrap();
        // 40 USDC at 2 USDC per WETH
        assert_eq!(position.position_amount, wad(20));
        assert_eq!(position.deposit_amount_in_sold_asset, wad(20));
        assert_eq!(position.scaled_debt_amount, wad(20));
        assert_eq!(fx.protocol.trader_position_count(trader()), 1);
        assert_eq!(
            fx.protocol.bucket(bucket_address()).unwrap().available_liquidity,
            wad(980)
        );
    }

    #[test]
    fn test_spot_cannot_borrow() {
        let mut fx = Fixture::new();
        let mut params = open_params(wad(20), wad(1));
        params.bucket = None;
        assert_eq!(
            fx.protocol.open_position(ctx(trader()), &params),
            Err(MarginError::SpotBorrow)
        );
    }

    #[test]
    fn test_open_from_vault_needs_balance() {
        let mut fx = Fixture::new();
        let mut params = open_params(wad(20), wad(20));
        params.is_deposit_from_wallet = false;
        let err = fx.protocol.open_position(ctx(trader()), &params).unwrap_err();
        assert!(matches!(err, MarginError::Vault(_)));

        fx.protocol.vault_mut().deposit(trader(), usdc(), wad(20)).unwrap();
        fx.protocol.open_position(ctx(trader()), &params).unwrap();
        assert_eq!(fx.protocol.vault().available(trader(), usdc()), U256::ZERO);
    }

    #[test]
    fn test_open_past_deadline() {
        let mut fx = Fixture::new();
        let mut params = open_params(wad(20), wad(20));
        params.deadline = 5;
        let err = fx
            .protocol
            .open_position(CallContext::new(trader(), 6), &params)
            .unwrap_err();
        assert_eq!(err, MarginError::DeadlinePassed { deadline: 5, now: 6 });
    }

    #[test]
    fn test_leverage_cap() {
        let mut fx = Fixture::new();
        // testing profile: 5% tolerance only, so the cap is 20x
        let err = fx
            .protocol
            .open_position(ctx(trader()), &open_params(wad(1), wad(25)))
            .unwrap_err();
        assert!(matches!(err, MarginError::LeverageExceeded { .. }));
    }

    #[test]
    fn test_close_requires_trader() {
        let mut fx = Fixture::new();
        let id = fx
            .protocol
            .open_position(ctx(trader()), &open_params(wad(20), wad(20)))
            .unwrap();
        let err = fx
            .protocol
            .close_position(ctx(keeper()), &close_params(id))
            .unwrap_err();
        assert_eq!(err, MarginError::CallerIsNotTrader { id, caller: keeper() });
    }

    #[test]
    fn test_close_pays_trader() {
        let mut fx = Fixture::new();
        let id = fx
            .protocol
            .open_position(ctx(trader()), &open_params(wad(20), wad(20)))
            .unwrap();
        fx.set_price(wad(3));

        let outcome = fx
            .protocol
            .close_position(ctx(trader()), &close_params(id))
            .unwrap();
        // 20 WETH sold for 60, 20 debt, 0.5% fee on 60
        let fee = wad(60) * U256::from(50u64) / U256::from(10_000u64);
        assert_eq!(outcome.amount_out, wad(60));
        assert_eq!(outcome.fee, fee);
        assert_eq!(outcome.to_trader, wad(40) - fee);
        assert_eq!(fx.protocol.vault().available(trader(), usdc()), wad(40) - fee);
        assert_eq!(fx.protocol.vault().available(treasury(), usdc()), fee);
        assert!(fx.protocol.position(id).is_err());
    }

    #[test]
    fn test_keeper_cannot_close_healthy_position() {
        let mut fx = Fixture::new();
        let id = fx
            .protocol
            .open_position(ctx(trader()), &open_params(wad(20), wad(20)))
            .unwrap();
        let err = fx
            .protocol
            .close_position_by_condition(
                ctx(keeper()),
                &CloseByConditionParams {
                    id,
                    routes: sell_route(),
                    condition_index: 0,
                    reason: CloseReason::RiskyPosition,
                    oracle_data: OracleData::none(),
                },
            )
            .unwrap_err();
        assert_eq!(
            err,
            MarginError::PositionNotEligible {
                id,
                reason: CloseReason::RiskyPosition
            }
        );
        assert!(fx.rewards.updates().is_empty());
    }

    #[test]
    fn test_liquidation_sends_remainder_to_treasury() {
        let mut fx = Fixture::new();
        let id = fx
            .protocol
            .open_position(ctx(trader()), &open_params(wad(10), wad(30)))
            .unwrap();
        // 20 WETH at 1.55: 0.95 * 31 / 30 < 1
        fx.set_price(wad(155) / U256::from(100u64));
        assert!(fx.protocol.is_risky(id, 0).unwrap());

        let outcome = fx
            .protocol
            .close_position_by_condition(
                ctx(keeper()),
                &CloseByConditionParams {
                    id,
                    routes: sell_route(),
                    condition_index: 0,
                    reason: CloseReason::RiskyPosition,
                    oracle_data: OracleData::none(),
                },
            )
            .unwrap();
        assert_eq!(outcome.amount_out, wad(31));
        assert_eq!(outcome.to_trader, U256::ZERO);
        assert_eq!(outcome.to_treasury, wad(1));
        assert_eq!(fx.protocol.vault().available(treasury(), usdc()), wad(1));
        assert_eq!(fx.rewards.actions_of(keeper()), 1);
        assert_eq!(fx.rewards.updates()[0].action, KeeperActionType::Liquidation);
    }

    #[test]
    fn test_stop_loss_condition() {
        let mut fx = Fixture::new();
        let mut params = open_params(wad(20), wad(20));
        params.close_conditions = vec![CloseCondition::take_profit_stop_loss(wad(3), wad(18) / U256::from(10u64))];
        let id = fx.protocol.open_position(ctx(trader()), &params).unwrap();

        let by_condition = CloseByConditionParams {
            id,
            routes: sell_route(),
            condition_index: 0,
            reason: CloseReason::LimitConditions,
            oracle_data: OracleData::none(),
        };
        let err = fx
            .protocol
            .close_position_by_condition(ctx(keeper()), &by_condition)
            .unwrap_err();
        assert_eq!(err, MarginError::ConditionNotMet { id, index: 0 });

        fx.set_price(wad(17) / U256::from(10u64));
        let outcome = fx
            .protocol
            .close_position_by_condition(ctx(keeper()), &by_condition)
            .unwrap();
        assert!(outcome.fee > U256::ZERO);
        assert_eq!(fx.rewards.updates()[0].action, KeeperActionType::StopLoss);
    }

    #[test]
    fn test_unsupported_reason() {
        let mut fx = Fixture::new();
        let id = fx
            .protocol
            .open_position(ctx(trader()), &open_params(wad(20), wad(20)))
            .unwrap();
        let err = fx
            .protocol
            .close_position_by_condition(
                ctx(keeper()),
                &CloseByConditionParams {
                    id,
                    routes: sell_route(),
                    condition_index: 0,
                    reason: CloseReason::BatchLiquidation,
                    oracle_data: OracleData::none(),
                },
            )
            .unwrap_err();
        assert_eq!(
            err,
            MarginError::UnsupportedCloseReason(CloseReason::BatchLiquidation)
        );
    }

    #[test]
    fn test_increase_deposit_repays_debt() {
        let mut fx = Fixture::new();
        let id = fx
            .protocol
            .open_position(ctx(trader()), &open_params(wad(20), wad(20)))
            .unwrap();
        let repaid = fx
            .protocol
            .increase_deposit(
                ctx(trader()),
                &IncreaseDepositParams {
                    id,
                    amount: wad(25),
                    asset: usdc(),
                    from_wallet: true,
                    routes: None,
                    amount_out_min: U256::ZERO,
                    deadline: u64::MAX,
                    oracle_data: OracleData::none(),
                },
            )
            .unwrap();
        assert_eq!(repaid, wad(20));

        let position = fx.protocol.position(id).unwrap();
        assert_eq!(position.scaled_debt_amount, U256::ZERO);
        assert_eq!(position.deposit_amount_in_sold_asset, wad(40));
        // excess returned to the vault
        assert_eq!(fx.protocol.vault().available(trader(), usdc()), wad(5));
    }

    #[test]
    fn test_decrease_deposit() {
        let mut fx = Fixture::new();
        let id = fx
            .protocol
            .open_position(ctx(trader()), &open_params(wad(20), wad(20)))
            .unwrap();
        let decrease = |amount| DecreaseDepositParams {
            id,
            amount,
            deadline: u64::MAX,
            oracle_data: OracleData::none(),
        };

        let err = fx
            .protocol
            .decrease_deposit(ctx(trader()), &decrease(wad(20)))
            .unwrap_err();
        assert!(matches!(err, MarginError::DecreaseNotBelowDeposit { .. }));

        fx.protocol
            .decrease_deposit(ctx(trader()), &decrease(wad(10)))
            .unwrap();
        let position = fx.protocol.position(id).unwrap();
        assert_eq!(position.deposit_amount_in_sold_asset, wad(10));
        assert_eq!(position.scaled_debt_amount, wad(30));
        assert_eq!(fx.protocol.vault().available(trader(), usdc()), wad(10));

        // 0.95 * 40 / 38 is exactly one; any further borrow is risky
        fx.protocol
            .decrease_deposit(ctx(trader()), &decrease(wad(8)))
            .unwrap();
        assert_eq!(fx.protocol.health_ratio(id, 0).unwrap(), WAD);
        let err = fx
            .protocol
            .decrease_deposit(ctx(trader()), &decrease(wad(1) / U256::from(2u64)))
            .unwrap_err();
        assert!(matches!(err, MarginError::InsufficientHealth { .. }));
    }

    #[test]
    fn test_update_conditions() {
        let mut fx = Fixture::new();
        let id = fx
            .protocol
            .open_position(ctx(trader()), &open_params(wad(20), wad(20)))
            .unwrap();
        fx.protocol
            .update_position_conditions(
                CallContext::new(trader(), 7),
                id,
                vec![CloseCondition::limit_price(wad(3))],
            )
            .unwrap();
        let position = fx.protocol.position(id).unwrap();
        assert_eq!(position.close_conditions.len(), 1);
        assert_eq!(position.updated_conditions_at, 7);

        let malformed = CloseCondition {
            kind: ConditionKind::LimitPrice,
            params: Default::default(),
        };
        let err = fx
            .protocol
            .update_position_conditions(ctx(trader()), id, vec![malformed])
            .unwrap_err();
        assert!(matches!(err, MarginError::InvalidConditionParams { .. }));
    }
}
