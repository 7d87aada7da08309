//! Protocol state container and transaction scaffolding.
//!
//! [`MarginProtocol`] owns every bucket, the position registry and the
//! trader balance vault. Entry points run inside [`MarginProtocol::atomically`]:
//! the state is cloned into a draft, the call mutates the draft through a
//! [`Txn`], and the draft replaces the live state only when the call
//! succeeds. Events and keeper reward updates buffered by the draft are
//! published on commit.

use alloy::primitives::{Address, U256};
use margin_chain::{
    AccessGate, BalanceVault, KeeperRewardDistributor, KeeperRewardParams, OracleData,
    PriceOracle, StagedOracle, TierProvider, TraderBalanceVault, USD,
};
use margin_dex::{RouteNode, SwapRouter};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bucket::{Bucket, BucketParams};
use crate::conditions::ConditionRegistry;
use crate::config::{EngineConfig, ResolvedMarkets};
use crate::error::{MarginError, MarginResult};
use crate::events::{EventLog, ProtocolEvent};
use crate::fees::{self, FeeRateType};
use crate::interest::{InterestRateStrategy, KinkedRateStrategy};
use crate::position::{self, HealthParams, Position};
use crate::position_tracker::PositionTracker;
use crate::u256_math::{self, Rounding, WAD};

/// External collaborators.
#[derive(Debug, Clone)]
pub struct Services {
    pub oracle: Arc<dyn PriceOracle>,
    pub router: Arc<dyn SwapRouter>,
    pub rewards: Arc<dyn KeeperRewardDistributor>,
    pub access: Arc<dyn AccessGate>,
    pub tiers: Arc<dyn TierProvider>,
}

/// Caller and block time of an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    pub sender: Address,
    pub timestamp: u64,
}

impl CallContext {
    pub fn new(sender: Address, timestamp: u64) -> Self {
        Self { sender, timestamp }
    }
}

/// Everything a failed call must leave untouched.
#[derive(Debug, Clone)]
pub(crate) struct ProtocolState<V> {
    pub(crate) buckets: BTreeMap<Address, Bucket>,
    pub(crate) positions: PositionTracker,
    pub(crate) vault: V,
    pending_events: Vec<ProtocolEvent>,
    pending_rewards: Vec<KeeperRewardParams>,
}

/// Margin protocol core.
pub struct MarginProtocol<V = TraderBalanceVault> {
    config: EngineConfig,
    markets: ResolvedMarkets,
    conditions: ConditionRegistry,
    strategy: Arc<dyn InterestRateStrategy>,
    services: Services,
    state: ProtocolState<V>,
    events: EventLog,
}

impl<V: BalanceVault + Clone> MarginProtocol<V> {
    /// Build the protocol with one bucket per market entry, all using the
    /// kinked rate model.
    pub fn new(
        config: EngineConfig,
        markets: ResolvedMarkets,
        services: Services,
        vault: V,
        now: u64,
    ) -> MarginResult<Self> {
        let mut protocol = Self {
            config,
            markets,
            conditions: ConditionRegistry::default(),
            strategy: Arc::new(KinkedRateStrategy),
            services,
            state: ProtocolState {
                buckets: BTreeMap::new(),
                positions: PositionTracker::new(),
                vault,
                pending_events: Vec::new(),
                pending_rewards: Vec::new(),
            },
            events: EventLog::new(),
        };
        let params: Vec<BucketParams> = protocol.markets.buckets.clone();
        for bucket in params {
            protocol.add_bucket(bucket, now)?;
        }
        info!(
            profile = %protocol.config.profile,
            buckets = protocol.state.buckets.len(),
            "Margin protocol initialised"
        );
        Ok(protocol)
    }

    /// Replace the condition table.
    pub fn with_conditions(mut self, conditions: ConditionRegistry) -> Self {
        self.conditions = conditions;
        self
    }

    /// Rate strategy used by buckets added afterwards.
    pub fn with_strategy(mut self, strategy: Arc<dyn InterestRateStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn add_bucket(&mut self, params: BucketParams, now: u64) -> MarginResult<()> {
        if self.state.buckets.contains_key(&params.address) {
            return Err(MarginError::BucketExists(params.address));
        }
        info!(bucket = %params.name, address = %params.address, asset = %params.asset, "Bucket added");
        let address = params.address;
        self.state
            .buckets
            .insert(address, Bucket::new(params, self.strategy.clone(), now));
        Ok(())
    }

    /// Run `f` against a draft of the state, committing only on success.
    pub(crate) fn atomically<T>(
        &mut self,
        ctx: CallContext,
        f: impl FnOnce(&mut Txn<'_, V>) -> MarginResult<T>,
    ) -> MarginResult<T> {
        let mut draft = self.state.clone();
        let (result, updates) = {
            let mut txn = Txn {
                config: &self.config,
                markets: &self.markets,
                conditions: &self.conditions,
                services: &self.services,
                prices: StagedOracle::new(self.services.oracle.as_ref()),
                state: &mut draft,
                ctx,
            };
            let result = f(&mut txn);
            (result, txn.prices.into_updates())
        };
        let result = result.and_then(|value| {
            if !updates.is_empty() {
                self.services.oracle.update_pull_prices(&updates)?;
                debug!(updates = updates.len(), "Pull prices applied");
            }
            Ok(value)
        });

        match result {
            Ok(value) => {
                let events = std::mem::take(&mut draft.pending_events);
                let rewards = std::mem::take(&mut draft.pending_rewards);
                self.state = draft;
                debug!(events = events.len(), rewards = rewards.len(), "Call committed");
                self.events.extend(events);
                for params in rewards {
                    self.services.rewards.update_reward(params);
                }
                Ok(value)
            }
            Err(err) => {
                warn!(sender = %ctx.sender, error = %err, kind = ?err.kind(), "Call reverted");
                Err(err)
            }
        }
    }

    // Lender and governance entry points

    /// Lender deposit from the wallet; returns minted scaled credit.
    pub fn lender_deposit(
        &mut self,
        ctx: CallContext,
        bucket: Address,
        amount: U256,
    ) -> MarginResult<U256> {
        self.atomically(ctx, |txn| {
            txn.ensure_not_blacklisted()?;
            let (bucket, events) = txn.bucket_and_events(bucket)?;
            bucket.deposit(ctx.sender, amount, ctx.timestamp, events)
        })
    }

    /// Lender withdrawal to the wallet; returns the payout after
    /// permanent-loss dilution.
    pub fn lender_withdraw(
        &mut self,
        ctx: CallContext,
        bucket: Address,
        amount: U256,
    ) -> MarginResult<U256> {
        self.atomically(ctx, |txn| {
            txn.ensure_not_blacklisted()?;
            let (bucket, events) = txn.bucket_and_events(bucket)?;
            bucket.withdraw(ctx.sender, amount, ctx.timestamp, events)
        })
    }

    /// Start the delisting countdown; returns the deadline.
    pub fn delist_bucket(&mut self, ctx: CallContext, bucket: Address) -> MarginResult<u64> {
        self.atomically(ctx, |txn| {
            let (bucket, events) = txn.bucket_and_events(bucket)?;
            bucket.accrue(ctx.timestamp, events)?;
            bucket.delist(ctx.timestamp, events)
        })
    }

    pub fn pay_back_permanent_loss(
        &mut self,
        ctx: CallContext,
        bucket: Address,
        amount: U256,
    ) -> MarginResult<U256> {
        self.atomically(ctx, |txn| {
            let (bucket, events) = txn.bucket_and_events(bucket)?;
            bucket.pay_back_permanent_loss(amount, ctx.timestamp, events)
        })
    }

    // Views

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn vault(&self) -> &V {
        &self.state.vault
    }

    /// Direct vault access for funding outside protocol calls.
    pub fn vault_mut(&mut self) -> &mut V {
        &mut self.state.vault
    }

    pub fn bucket(&self, address: Address) -> MarginResult<&Bucket> {
        self.state
            .buckets
            .get(&address)
            .ok_or(MarginError::BucketNotFound(address))
    }

    pub fn positions(&self) -> &PositionTracker {
        &self.state.positions
    }

    pub fn position(&self, id: u64) -> MarginResult<&Position> {
        self.state.positions.get(id)
    }

    /// Debt of a position at the bucket's index projected to `now`.
    pub fn position_debt(&self, id: u64, now: u64) -> MarginResult<U256> {
        let position = self.state.positions.get(id)?;
        match position.bucket {
            None => Ok(U256::ZERO),
            Some(bucket) => {
                let vbi = self.bucket(bucket)?.variable_borrow_index_at(now)?;
                position.debt(vbi)
            }
        }
    }

    pub fn health_ratio(&self, id: u64, now: u64) -> MarginResult<U256> {
        let position = self.state.positions.get(id)?;
        let Some(address) = position.bucket else {
            return Ok(U256::MAX);
        };
        let bucket = self.bucket(address)?;
        let debt = position.debt(bucket.variable_borrow_index_at(now)?)?;
        position_health(
            &self.config,
            &self.markets,
            self.services.oracle.as_ref(),
            position,
            bucket,
            debt,
        )
    }

    /// Health below one. Spot positions are never risky.
    pub fn is_risky(&self, id: u64, now: u64) -> MarginResult<bool> {
        Ok(position::is_risky(self.health_ratio(id, now)?))
    }

    pub fn trader_position_count(&self, trader: Address) -> usize {
        self.state.positions.trader_position_count(trader)
    }

    pub fn bucket_position_ids(&self, bucket: Address) -> Vec<u64> {
        self.state.positions.bucket_position_ids(bucket)
    }
}

/// Health of `position` against `debt`, using the pair tolerance without
/// any trusted-caller widening.
pub(crate) fn position_health(
    config: &EngineConfig,
    markets: &ResolvedMarkets,
    oracle: &dyn PriceOracle,
    position: &Position,
    bucket: &Bucket,
    debt: U256,
) -> MarginResult<U256> {
    let rate = oracle.rate(position.position_asset, position.sold_asset)?;
    let value = u256_math::wad_mul(position.position_amount, rate, Rounding::Down)?;
    let params = HealthParams {
        security_buffer: u256_math::bps_to_wad(config.position.security_buffer_bps),
        oracle_tolerable_limit: markets.oracle_tolerable_limit(
            position.position_asset,
            position.sold_asset,
            u256_math::bps_to_wad(config.position.default_oracle_tolerable_limit_bps),
        ),
        pair_price_drop: oracle.pair_price_drop(position.position_asset, position.sold_asset),
        fee_buffer: bucket.fee_buffer(),
    };
    position::health_ratio(value, debt, &params)
}

/// Mutable view of a draft state for the duration of one call.
pub(crate) struct Txn<'a, V> {
    pub(crate) config: &'a EngineConfig,
    pub(crate) markets: &'a ResolvedMarkets,
    pub(crate) conditions: &'a ConditionRegistry,
    pub(crate) services: &'a Services,
    /// Pull updates staged by this call, applied to the oracle on commit
    pub(crate) prices: StagedOracle<'a>,
    pub(crate) state: &'a mut ProtocolState<V>,
    pub(crate) ctx: CallContext,
}

impl<V: BalanceVault> Txn<'_, V> {
    pub(crate) fn now(&self) -> u64 {
        self.ctx.timestamp
    }

    pub(crate) fn sender(&self) -> Address {
        self.ctx.sender
    }

    /// Backing oracle as seen through this call's staged pull updates.
    pub(crate) fn oracle(&self) -> &dyn PriceOracle {
        &self.prices
    }

    pub(crate) fn treasury(&self) -> Address {
        self.config.fees.treasury
    }

    pub(crate) fn emit(&mut self, event: ProtocolEvent) {
        self.state.pending_events.push(event);
    }

    pub(crate) fn report_reward(&mut self, params: KeeperRewardParams) {
        self.state.pending_rewards.push(params);
    }

    pub(crate) fn ensure_not_blacklisted(&self) -> MarginResult<()> {
        if self.services.access.is_blacklisted(self.ctx.sender) {
            return Err(MarginError::Blacklisted(self.ctx.sender));
        }
        Ok(())
    }

    /// Entry checks shared by every position call: caller, deadline and
    /// pull-oracle updates.
    pub(crate) fn enter(&mut self, deadline: Option<u64>, oracle_data: &OracleData) -> MarginResult<()> {
        self.ensure_not_blacklisted()?;
        if let Some(deadline) = deadline {
            if self.now() > deadline {
                return Err(MarginError::DeadlinePassed {
                    deadline,
                    now: self.now(),
                });
            }
        }
        oracle_data.ensure_fee_covered()?;
        self.prices.stage(&oracle_data.updates)?;
        Ok(())
    }

    pub(crate) fn bucket(&self, address: Address) -> MarginResult<&Bucket> {
        self.state
            .buckets
            .get(&address)
            .ok_or(MarginError::BucketNotFound(address))
    }

    /// Split borrow of a bucket and the pending event list.
    pub(crate) fn bucket_and_events(
        &mut self,
        address: Address,
    ) -> MarginResult<(&mut Bucket, &mut Vec<ProtocolEvent>)> {
        let state = &mut *self.state;
        let bucket = state
            .buckets
            .get_mut(&address)
            .ok_or(MarginError::BucketNotFound(address))?;
        Ok((bucket, &mut state.pending_events))
    }

    /// Accrue the bucket and return its live variable borrow index.
    pub(crate) fn accrue(&mut self, address: Address) -> MarginResult<U256> {
        let now = self.now();
        let (bucket, events) = self.bucket_and_events(address)?;
        bucket.accrue(now, events)?;
        Ok(bucket.variable_borrow_index)
    }

    /// Oracle tolerance for the pair, widened for trusted callers.
    pub(crate) fn oracle_tolerance(&self, a: Address, b: Address) -> MarginResult<U256> {
        let base = self.markets.oracle_tolerable_limit(
            a,
            b,
            u256_math::bps_to_wad(self.config.position.default_oracle_tolerable_limit_bps),
        );
        if !self.services.access.is_trusted(self.ctx.sender) {
            return Ok(base);
        }
        let widened = base.saturating_mul(U256::from(
            self.config.position.trusted_tolerable_limit_multiplier,
        ));
        Ok(widened.min(WAD))
    }

    /// Swap through the router and check the realised output against the
    /// oracle within tolerance. Same-asset swaps pass through.
    pub(crate) fn swap(
        &mut self,
        route: &RouteNode,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        min_out: U256,
    ) -> MarginResult<U256> {
        if token_in == token_out || amount_in.is_zero() {
            return Ok(amount_in);
        }
        let amount_out = self
            .services
            .router
            .swap(route, token_in, token_out, amount_in, min_out)?;

        let rate = self.oracle().rate(token_in, token_out)?;
        let expected = u256_math::wad_mul(amount_in, rate, Rounding::Down)?;
        let tolerance = self.oracle_tolerance(token_in, token_out)?;
        let min_expected =
            u256_math::wad_mul(expected, u256_math::one_minus(tolerance)?, Rounding::Down)?;
        if amount_out < min_expected {
            return Err(MarginError::DifferentPriceDexAndOracle {
                amount_out,
                min_expected,
            });
        }
        debug!(%token_in, %token_out, %amount_in, %amount_out, %expected, "Swap checked against oracle");
        Ok(amount_out)
    }

    /// Health at the bucket's current (already accrued) index.
    pub(crate) fn health(&self, position: &Position) -> MarginResult<U256> {
        let Some(address) = position.bucket else {
            return Ok(U256::MAX);
        };
        let bucket = self.bucket(address)?;
        let debt = position.debt(bucket.variable_borrow_index)?;
        position_health(self.config, self.markets, self.oracle(), position, bucket, debt)
    }

    /// Check a notional in `asset` against the USD size bounds.
    pub(crate) fn check_size(&self, asset: Address, amount: U256) -> MarginResult<()> {
        let bounds = &self.config.position;
        if bounds.min_position_size_usd <= 0.0 && bounds.max_position_size_usd <= 0.0 {
            return Ok(());
        }
        let rate = self.oracle().rate(asset, USD)?;
        let value_usd = u256_math::wad_mul(amount, rate, Rounding::Down)?;
        let min_usd = u256_math::f64_to_wad(bounds.min_position_size_usd);
        if value_usd < min_usd {
            return Err(MarginError::PositionTooSmall { value_usd, min_usd });
        }
        let max_usd = u256_math::f64_to_wad(bounds.max_position_size_usd);
        if !max_usd.is_zero() && value_usd > max_usd {
            return Err(MarginError::PositionTooLarge { value_usd, max_usd });
        }
        Ok(())
    }

    /// Charge the protocol fee on `notional` of `payment_asset`. At most
    /// `from_proceeds` is taken from the payment asset; the discount-token
    /// part, if any, is debited from the trader's vault balance. Returns
    /// the amount taken from proceeds.
    pub(crate) fn charge_fee(
        &mut self,
        position: &Position,
        rate_type: FeeRateType,
        payment_asset: Address,
        notional: U256,
        from_proceeds: U256,
    ) -> MarginResult<U256> {
        let tier = self.services.tiers.trader_tier(position.trader);
        let fee = fees::protocol_fee(
            &self.config.fees,
            self.oracle(),
            rate_type,
            tier,
            payment_asset,
            notional,
        )?;

        let mut in_payment_asset = fee;
        let mut in_discount_token = U256::ZERO;
        if let (true, Some(token)) = (position.fee_in_discount_token, self.config.fees.discount_token) {
            let fee_in_token =
                fees::fee_in_discount_token(&self.config.fees, self.oracle(), fee, payment_asset, token)?;
            let available = self.state.vault.available(position.trader, token);
            let split = fees::split_discount_payment(fee, fee_in_token, available)?;
            if !split.in_discount_token.is_zero() {
                self.state
                    .vault
                    .debit_available(position.trader, token, split.in_discount_token)?;
                let treasury = self.treasury();
                self.state.vault.credit(treasury, token, split.in_discount_token);
            }
            in_payment_asset = split.in_payment_asset;
            in_discount_token = split.in_discount_token;
        }

        let in_payment_asset = in_payment_asset.min(from_proceeds);
        let treasury = self.treasury();
        self.state.vault.credit(treasury, payment_asset, in_payment_asset);
        self.emit(ProtocolEvent::PaidProtocolFee {
            position_id: position.id,
            trader: position.trader,
            payment_asset,
            fee_rate_type: rate_type,
            fee_in_payment_asset: in_payment_asset,
            fee_in_discount_token: in_discount_token,
        });
        Ok(in_payment_asset)
    }
}


#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;
    use margin_chain::PullUpdate;

    #[test]
    fn test_failed_call_leaves_state() {
        let mut fx = Fixture::new();
        let before = fx.protocol.bucket(bucket_address()).unwrap().available_liquidity;
        let events = fx.protocol.events().len();

        let err = fx
            .protocol
            .lender_withdraw(CallContext::new(lender(), 10), bucket_address(), wad(5000))
            .unwrap_err();
        assert!(matches!(err, MarginError::InsufficientScaledBalance { .. }));
        assert_eq!(
            fx.protocol.bucket(bucket_address()).unwrap().available_liquidity,
            before
        );
        assert_eq!(fx.protocol.events().len(), events);
        assert_eq!(fx.protocol.bucket(bucket_address()).unwrap().last_accrual, 0);
    }

    #[test]
    fn test_blacklisted_lender() {
        let mut fx = Fixture::new();
        fx.access.blacklist(lender());
        let err = fx
            .protocol
            .lender_deposit(CallContext::new(lender(), 1), bucket_address(), wad(1))
            .unwrap_err();
        assert_eq!(err, MarginError::Blacklisted(lender()));
    }

    #[test]
    fn test_duplicate_bucket_rejected() {
        let mut fx = Fixture::new();
        let params = fx.protocol.bucket(bucket_address()).unwrap().params().clone();
        assert_eq!(
            fx.protocol.add_bucket(params, 0),
            Err(MarginError::BucketExists(bucket_address()))
        );
    }

    #[test]
    fn test_trusted_tolerance_is_widened() {
        let mut fx = Fixture::new();
        fx.access.trust(keeper());
        let base = u256_math::bps_to_wad(500);
        let tolerance = fx
            .protocol
            .atomically(CallContext::new(keeper(), 0), |txn| {
                txn.oracle_tolerance(weth(), usdc())
            })
            .unwrap();
        assert_eq!(tolerance, base * U256::from(2u64));
    }

    #[test]
    fn test_swap_rejects_oracle_divergence() {
        let mut fx = Fixture::new();
        // dex pays 10% less than the oracle; tolerance is 5%
        fx.venue.set_rate(weth(), usdc(), wad(18) / U256::from(10u64));
        let err = fx
            .protocol
            .atomically(CallContext::new(trader(), 0), |txn| {
                txn.swap(&sell_route(), weth(), usdc(), wad(1), U256::ZERO)
            })
            .unwrap_err();
        assert!(matches!(err, MarginError::DifferentPriceDexAndOracle { .. }));
    }

    fn price_update(rate: U256) -> OracleData {
        OracleData {
            updates: vec![PullUpdate::encode(weth(), usdc(), rate, U256::ZERO)],
            fee_paid: U256::ZERO,
        }
    }

    #[test]
    fn test_reverted_call_discards_pull_updates() {
        let mut fx = Fixture::new();
        let err = fx
            .protocol
            .atomically(CallContext::new(keeper(), 1), |txn| {
                txn.enter(None, &price_update(wad(3)))?;
                assert_eq!(txn.oracle().rate(weth(), usdc())?, wad(3));
                Err::<(), _>(MarginError::ZeroAmount)
            })
            .unwrap_err();
        assert_eq!(err, MarginError::ZeroAmount);
        assert_eq!(fx.oracle.rate(weth(), usdc()).unwrap(), wad(2));
    }

    #[test]
    fn test_committed_call_applies_pull_updates() {
        let mut fx = Fixture::new();
        fx.protocol
            .atomically(CallContext::new(keeper(), 1), |txn| {
                txn.enter(None, &price_update(wad(3)))
            })
            .unwrap();
        assert_eq!(fx.oracle.rate(weth(), usdc()).unwrap(), wad(3));
    }
}
