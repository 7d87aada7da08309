//! Single-asset lending bucket.
//!
//! The bucket owns the liquidity and variable borrow indices, mints and
//! burns scaled debt and credit, and tracks uncollateralized shortfall as
//! permanent loss shared by lenders. Every mutating entry point accrues
//! interest first.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{MarginError, MarginResult};
use crate::events::ProtocolEvent;
use crate::interest::{self, InterestRateStrategy, RateModelParams};
use crate::scaled::{CreditToken, DebtToken};
use crate::u256_math::{self, Rounding, RAY, WAD};

/// Static bucket parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketParams {
    pub name: String,
    pub address: Address,
    /// Lent asset, also the sold asset of every margin position
    pub asset: Address,
    /// Position assets traders may buy with borrowed funds
    pub allowed_assets: BTreeSet<Address>,
    /// WAD multiplier applied to debt in the health formula (>= 1)
    pub fee_buffer: U256,
    /// WAD share of borrower interest kept by the treasury
    pub reserve_rate: U256,
    pub rate_params: RateModelParams,
    /// Cap on total lender credit; zero means unbounded
    pub max_total_deposit: U256,
    /// Seconds between delisting and the forced-close deadline
    pub delisting_deadline_period: u64,
    /// Receives reserve credit
    pub treasury: Address,
}

#[derive(Debug, Clone)]
pub struct Bucket {
    params: BucketParams,
    pub liquidity_index: U256,
    pub variable_borrow_index: U256,
    /// Borrow annual rate (RAY)
    pub bar: U256,
    /// Liquidity annual rate (RAY)
    pub lar: U256,
    pub last_accrual: u64,
    pub permanent_loss_scaled: U256,
    pub available_liquidity: U256,
    pub delisting_deadline: Option<u64>,
    debt: DebtToken,
    credit: CreditToken,
    strategy: Arc<dyn InterestRateStrategy>,
}

impl Bucket {
    pub fn new(params: BucketParams, strategy: Arc<dyn InterestRateStrategy>, now: u64) -> Self {
        Self {
            params,
            liquidity_index: RAY,
            variable_borrow_index: RAY,
            bar: U256::ZERO,
            lar: U256::ZERO,
            last_accrual: now,
            permanent_loss_scaled: U256::ZERO,
            available_liquidity: U256::ZERO,
            delisting_deadline: None,
            debt: DebtToken::default(),
            credit: CreditToken::default(),
            strategy,
        }
    }

    pub fn address(&self) -> Address {
        self.params.address
    }

    pub fn asset(&self) -> Address {
        self.params.asset
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn fee_buffer(&self) -> U256 {
        self.params.fee_buffer
    }

    pub fn params(&self) -> &BucketParams {
        &self.params
    }

    pub fn debt_token(&self) -> &DebtToken {
        &self.debt
    }

    pub fn credit_token(&self) -> &CreditToken {
        &self.credit
    }

    pub fn is_asset_allowed(&self, asset: Address) -> bool {
        self.params.allowed_assets.contains(&asset)
    }

    pub fn total_debt(&self) -> MarginResult<U256> {
        self.debt.ledger().total_supply(self.variable_borrow_index)
    }

    pub fn total_credit(&self) -> MarginResult<U256> {
        self.credit.ledger().total_supply(self.liquidity_index)
    }

    pub fn utilization(&self) -> MarginResult<U256> {
        Ok(interest::utilization(
            self.total_debt()?,
            self.available_liquidity,
        )?)
    }

    /// Bring both indices up to `now`. A second call at the same timestamp
    /// changes nothing.
    pub fn accrue(&mut self, now: u64, events: &mut Vec<ProtocolEvent>) -> MarginResult<()> {
        if now <= self.last_accrual {
            return Ok(());
        }
        let elapsed = now - self.last_accrual;

        let debt_before = self.total_debt()?;
        let borrow_factor = self.strategy.compounded_factor(self.bar, elapsed)?;
        let liquidity_factor = self.strategy.compounded_factor(self.lar, elapsed)?;
        let new_vbi = u256_math::ray_mul(self.variable_borrow_index, borrow_factor, Rounding::Down)?;
        let new_li = u256_math::ray_mul(self.liquidity_index, liquidity_factor, Rounding::Down)?;

        self.variable_borrow_index = new_vbi.max(self.variable_borrow_index);
        self.liquidity_index = new_li.max(self.liquidity_index);
        self.last_accrual = now;

        let accrued = u256_math::sub(self.total_debt()?, debt_before).unwrap_or_default();
        let reserve = u256_math::wad_mul(accrued, self.params.reserve_rate, Rounding::Down)?;
        if !reserve.is_zero() {
            self.credit
                .mint(self.params.treasury, reserve, self.liquidity_index)?;
        }

        self.update_rates()?;
        debug!(
            bucket = %self.params.address,
            elapsed,
            vbi = %self.variable_borrow_index,
            li = %self.liquidity_index,
            %reserve,
            "Bucket accrued"
        );
        events.push(self.indexes_event());
        Ok(())
    }

    /// Variable borrow index as of `now` without touching state.
    pub fn variable_borrow_index_at(&self, now: u64) -> MarginResult<U256> {
        if now <= self.last_accrual {
            return Ok(self.variable_borrow_index);
        }
        let factor = self
            .strategy
            .compounded_factor(self.bar, now - self.last_accrual)?;
        let projected = u256_math::ray_mul(self.variable_borrow_index, factor, Rounding::Down)?;
        Ok(projected.max(self.variable_borrow_index))
    }

    fn update_rates(&mut self) -> MarginResult<()> {
        let (bar, lar) = self.strategy.rates(
            self.utilization()?,
            &self.params.rate_params,
            self.params.reserve_rate,
        )?;
        self.bar = bar;
        self.lar = lar;
        Ok(())
    }

    fn indexes_event(&self) -> ProtocolEvent {
        ProtocolEvent::IndexesUpdated {
            bucket: self.params.address,
            liquidity_index: self.liquidity_index,
            variable_borrow_index: self.variable_borrow_index,
            bar: self.bar,
            lar: self.lar,
            timestamp: self.last_accrual,
        }
    }

    /// Borrow `amount` for a position in `position_asset`; returns the
    /// minted scaled debt.
    pub fn borrow(
        &mut self,
        trader: Address,
        position_asset: Address,
        amount: U256,
        now: u64,
        events: &mut Vec<ProtocolEvent>,
    ) -> MarginResult<U256> {
        if amount.is_zero() {
            return Err(MarginError::ZeroAmount);
        }
        if self.is_delisted() {
            return Err(MarginError::BucketDelisted(self.params.address));
        }
        if !self.is_asset_allowed(position_asset) {
            return Err(MarginError::AssetNotAllowed {
                bucket: self.params.address,
                asset: position_asset,
            });
        }
        if amount > self.available_liquidity {
            return Err(MarginError::InsufficientLiquidity {
                available: self.available_liquidity,
                requested: amount,
            });
        }

        self.accrue(now, events)?;
        let scaled = self.debt.mint(trader, amount, self.variable_borrow_index)?;
        if scaled.is_zero() {
            return Err(MarginError::ZeroAmount);
        }
        self.available_liquidity -= amount;
        self.update_rates()?;

        events.push(ProtocolEvent::Borrow {
            bucket: self.params.address,
            trader,
            amount,
            scaled,
        });
        Ok(scaled)
    }

    /// Repay up to `amount` of the trader's debt. The burn is capped at the
    /// trader's scaled balance; returns `(repaid, scaled_burned)`.
    pub fn repay(
        &mut self,
        trader: Address,
        amount: U256,
        now: u64,
        events: &mut Vec<ProtocolEvent>,
    ) -> MarginResult<(U256, U256)> {
        if amount.is_zero() {
            return Err(MarginError::ZeroAmount);
        }
        self.accrue(now, events)?;
        let held = self.debt.ledger().scaled_balance_of(trader);
        let wanted = u256_math::ray_div(amount, self.variable_borrow_index, Rounding::Down)?;
        let scaled = wanted.min(held);
        let repaid = if scaled == held {
            amount.min(self.debt.ledger().balance_of(trader, self.variable_borrow_index)?)
        } else {
            amount
        };
        self.repay_scaled(trader, scaled, repaid, now, events)?;
        Ok((repaid, scaled))
    }

    /// Burn exactly `scaled` of the trader's debt, returning `paid` of the
    /// bucket asset to the pool.
    pub fn repay_scaled(
        &mut self,
        trader: Address,
        scaled: U256,
        paid: U256,
        now: u64,
        events: &mut Vec<ProtocolEvent>,
    ) -> MarginResult<()> {
        self.accrue(now, events)?;
        self.debt.burn_scaled(trader, scaled)?;
        self.available_liquidity = u256_math::add(self.available_liquidity, paid)?;
        self.update_rates()?;
        events.push(ProtocolEvent::Repay {
            bucket: self.params.address,
            trader,
            amount: paid,
            scaled,
        });
        Ok(())
    }

    /// Batch close settlement: one accrual, one burn per entry, one
    /// permanent-loss registration for the aggregate shortfall.
    pub fn batch_repay(
        &mut self,
        burns: &[(Address, U256)],
        paid: U256,
        shortfall: U256,
        now: u64,
        events: &mut Vec<ProtocolEvent>,
    ) -> MarginResult<()> {
        self.accrue(now, events)?;
        for (trader, scaled) in burns {
            self.debt.burn_scaled(*trader, *scaled)?;
        }
        self.available_liquidity = u256_math::add(self.available_liquidity, paid)?;
        if !shortfall.is_zero() {
            self.register_permanent_loss(shortfall, events)?;
        }
        self.update_rates()?;
        let scaled_total = burns
            .iter()
            .try_fold(U256::ZERO, |acc, (_, s)| u256_math::add(acc, *s))?;
        events.push(ProtocolEvent::Repay {
            bucket: self.params.address,
            trader: Address::ZERO,
            amount: paid,
            scaled: scaled_total,
        });
        Ok(())
    }

    /// Record an uncollateralized shortfall against lenders.
    pub fn register_permanent_loss(
        &mut self,
        shortfall: U256,
        events: &mut Vec<ProtocolEvent>,
    ) -> MarginResult<()> {
        let scaled = u256_math::ray_div(shortfall, self.liquidity_index, Rounding::Down)?;
        self.permanent_loss_scaled = u256_math::add(self.permanent_loss_scaled, scaled)?;
        warn!(
            bucket = %self.params.address,
            %shortfall,
            permanent_loss_scaled = %self.permanent_loss_scaled,
            "Permanent loss registered"
        );
        events.push(ProtocolEvent::PermanentLoss {
            bucket: self.params.address,
            shortfall,
            permanent_loss_scaled: self.permanent_loss_scaled,
        });
        Ok(())
    }

    /// Cover previously registered loss with fresh funds; returns the
    /// amount applied.
    pub fn pay_back_permanent_loss(
        &mut self,
        amount: U256,
        now: u64,
        events: &mut Vec<ProtocolEvent>,
    ) -> MarginResult<U256> {
        if amount.is_zero() {
            return Err(MarginError::ZeroAmount);
        }
        self.accrue(now, events)?;
        let outstanding =
            u256_math::ray_mul(self.permanent_loss_scaled, self.liquidity_index, Rounding::Up)?;
        let applied = amount.min(outstanding);
        let scaled = if applied == outstanding {
            self.permanent_loss_scaled
        } else {
            u256_math::ray_div(applied, self.liquidity_index, Rounding::Down)?
                .min(self.permanent_loss_scaled)
        };
        self.permanent_loss_scaled -= scaled;
        self.available_liquidity = u256_math::add(self.available_liquidity, applied)?;
        self.update_rates()?;
        events.push(ProtocolEvent::PermanentLoss {
            bucket: self.params.address,
            shortfall: U256::ZERO,
            permanent_loss_scaled: self.permanent_loss_scaled,
        });
        Ok(applied)
    }

    /// Lender deposit; returns the minted scaled credit.
    pub fn deposit(
        &mut self,
        lender: Address,
        amount: U256,
        now: u64,
        events: &mut Vec<ProtocolEvent>,
    ) -> MarginResult<U256> {
        if amount.is_zero() {
            return Err(MarginError::ZeroAmount);
        }
        if self.is_delisted() {
            return Err(MarginError::BucketDelisted(self.params.address));
        }
        self.accrue(now, events)?;

        let cap = self.params.max_total_deposit;
        if !cap.is_zero() {
            let total = u256_math::add(self.total_credit()?, amount)?;
            if total > cap {
                return Err(MarginError::DepositCapExceeded { total, cap });
            }
        }

        let scaled = self.credit.mint(lender, amount, self.liquidity_index)?;
        if scaled.is_zero() {
            return Err(MarginError::ZeroAmount);
        }
        self.available_liquidity = u256_math::add(self.available_liquidity, amount)?;
        self.update_rates()?;
        info!(bucket = %self.params.address, %lender, %amount, "Lender deposit");
        events.push(ProtocolEvent::Deposit {
            bucket: self.params.address,
            lender,
            amount,
            scaled,
        });
        Ok(scaled)
    }

    /// Lender withdrawal of `amount` of credit. The lender's pro-rata share
    /// of permanent loss is realised on the burned credit, so the payout may
    /// be below `amount`. Returns the payout.
    pub fn withdraw(
        &mut self,
        lender: Address,
        amount: U256,
        now: u64,
        events: &mut Vec<ProtocolEvent>,
    ) -> MarginResult<U256> {
        if amount.is_zero() {
            return Err(MarginError::ZeroAmount);
        }
        self.accrue(now, events)?;

        let held = self.credit.ledger().scaled_balance_of(lender);
        let balance = self.credit.ledger().balance_of(lender, self.liquidity_index)?;
        if amount > balance {
            return Err(MarginError::InsufficientScaledBalance {
                holder: lender,
                held,
                requested: u256_math::ray_div(amount, self.liquidity_index, Rounding::Up)?,
            });
        }
        let scaled = u256_math::ray_div(amount, self.liquidity_index, Rounding::Up)?.min(held);

        let supply = self.credit.ledger().scaled_total_supply();
        let loss_share = u256_math::mul_div(
            self.permanent_loss_scaled,
            scaled,
            supply,
            Rounding::Down,
        )?
        .min(scaled);
        let paid_out =
            u256_math::ray_mul(scaled - loss_share, self.liquidity_index, Rounding::Down)?
                .min(amount);

        if paid_out > self.available_liquidity {
            return Err(MarginError::InsufficientLiquidity {
                available: self.available_liquidity,
                requested: paid_out,
            });
        }

        self.credit.burn_scaled(lender, scaled)?;
        self.permanent_loss_scaled -= loss_share;
        self.available_liquidity -= paid_out;
        self.update_rates()?;
        info!(bucket = %self.params.address, %lender, %amount, %paid_out, "Lender withdraw");
        events.push(ProtocolEvent::Withdraw {
            bucket: self.params.address,
            lender,
            amount,
            paid_out,
        });
        Ok(paid_out)
    }

    /// Start the delisting countdown.
    pub fn delist(&mut self, now: u64, events: &mut Vec<ProtocolEvent>) -> MarginResult<u64> {
        if self.is_delisted() {
            return Err(MarginError::AlreadyDelisted(self.params.address));
        }
        let deadline = now.saturating_add(self.params.delisting_deadline_period);
        self.delisting_deadline = Some(deadline);
        warn!(bucket = %self.params.address, deadline, "Bucket delisted");
        events.push(ProtocolEvent::Delisted {
            bucket: self.params.address,
            deadline,
        });
        Ok(deadline)
    }

    pub fn is_delisted(&self) -> bool {
        self.delisting_deadline.is_some()
    }

    pub fn is_delisting_deadline_passed(&self, now: u64) -> bool {
        self.delisting_deadline.is_some_and(|deadline| now > deadline)
    }

    /// Leverage at which a freshly opened position sits exactly at
    /// `1 + maintenance_buffer` health (all inputs WAD):
    /// `fb(1+mb) / (fb(1+mb) - (1-sb)(1-otl)(1-ppd))`.
    pub fn max_asset_leverage(
        &self,
        security_buffer: U256,
        oracle_tolerable_limit: U256,
        pair_price_drop: U256,
        maintenance_buffer: U256,
    ) -> MarginResult<U256> {
        let buffered = u256_math::wad_mul(
            self.params.fee_buffer,
            u256_math::add(WAD, maintenance_buffer)?,
            Rounding::Down,
        )?;
        let discount = u256_math::wad_mul(
            u256_math::wad_mul(
                u256_math::one_minus(security_buffer)?,
                u256_math::one_minus(oracle_tolerable_limit)?,
                Rounding::Down,
            )?,
            u256_math::one_minus(pair_price_drop)?,
            Rounding::Down,
        )?;
        if buffered <= discount {
            return Ok(U256::MAX);
        }
        Ok(u256_math::wad_div(buffered, buffered - discount, Rounding::Down)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest::KinkedRateStrategy;
    use crate::u256_math::SECONDS_PER_YEAR;

    fn wad(n: u64) -> U256 {
        U256::from(n) * WAD
    }

    fn pct_ray(p: u64) -> U256 {
        RAY * U256::from(p) / U256::from(100u64)
    }

    fn bucket(rate_pct: u64) -> Bucket {
        let asset = Address::repeat_byte(0xAA);
        let params = BucketParams {
            name: "test".into(),
            address: Address::repeat_byte(0xB0),
            asset,
            allowed_assets: [Address::repeat_byte(0xCC)].into_iter().collect(),
            fee_buffer: WAD + WAD / U256::from(1000u64),
            reserve_rate: U256::ZERO,
            rate_params: RateModelParams::fixed(pct_ray(rate_pct)),
            max_total_deposit: U256::ZERO,
            delisting_deadline_period: 100,
            treasury: Address::repeat_byte(0xEE),
        };
        Bucket::new(params, Arc::new(KinkedRateStrategy), 0)
    }

    #[test]
    fn test_accrue_same_timestamp_is_noop() {
        let mut b = bucket(10);
        let mut events = Vec::new();
        b.deposit(Address::repeat_byte(1), wad(50), 0, &mut events).unwrap();
        b.borrow(Address::repeat_byte(2), Address::repeat_byte(0xCC), wad(25), 0, &mut events)
            .unwrap();

        b.accrue(1_000, &mut events).unwrap();
        let (li, vbi) = (b.liquidity_index, b.variable_borrow_index);
        let n = events.len();
        b.accrue(1_000, &mut events).unwrap();
        assert_eq!((b.liquidity_index, b.variable_borrow_index), (li, vbi));
        assert_eq!(events.len(), n);
    }

    #[test]
    fn test_debt_grows_over_a_year() {
        let mut b = bucket(10);
        let mut events = Vec::new();
        let trader = Address::repeat_byte(2);
        b.deposit(Address::repeat_byte(1), wad(50), 0, &mut events).unwrap();
        b.borrow(trader, Address::repeat_byte(0xCC), wad(25), 0, &mut events)
            .unwrap();

        b.accrue(SECONDS_PER_YEAR, &mut events).unwrap();
        let debt = b
            .debt_token()
            .ledger()
            .balance_of(trader, b.variable_borrow_index)
            .unwrap();
        assert!(debt > wad(25));
        assert!(b.liquidity_index > RAY);
    }

    #[test]
    fn test_borrow_failure_modes_leave_state() {
        let mut b = bucket(10);
        let mut events = Vec::new();
        b.deposit(Address::repeat_byte(1), wad(10), 0, &mut events).unwrap();

        let err = b
            .borrow(Address::repeat_byte(2), Address::repeat_byte(0xDD), wad(1), 5, &mut events)
            .unwrap_err();
        assert!(matches!(err, MarginError::AssetNotAllowed { .. }));

        let err = b
            .borrow(Address::repeat_byte(2), Address::repeat_byte(0xCC), wad(11), 5, &mut events)
            .unwrap_err();
        assert!(matches!(err, MarginError::InsufficientLiquidity { .. }));
        assert_eq!(b.available_liquidity, wad(10));
        assert_eq!(b.last_accrual, 0);
    }

    #[test]
    fn test_repay_is_capped() {
        let mut b = bucket(0);
        let mut events = Vec::new();
        let trader = Address::repeat_byte(2);
        b.deposit(Address::repeat_byte(1), wad(10), 0, &mut events).unwrap();
        b.borrow(trader, Address::repeat_byte(0xCC), wad(4), 0, &mut events)
            .unwrap();

        let (repaid, scaled) = b.repay(trader, wad(9), 0, &mut events).unwrap();
        assert_eq!(repaid, wad(4));
        assert_eq!(scaled, wad(4));
        assert_eq!(b.debt_token().ledger().scaled_total_supply(), U256::ZERO);
        assert_eq!(b.available_liquidity, wad(10));
    }

    #[test]
    fn test_permanent_loss_dilutes_withdrawals() {
        let mut b = bucket(0);
        let mut events = Vec::new();
        let (l1, l2) = (Address::repeat_byte(1), Address::repeat_byte(2));
        b.deposit(l1, wad(50), 0, &mut events).unwrap();
        b.deposit(l2, wad(50), 0, &mut events).unwrap();

        b.register_permanent_loss(wad(10), &mut events).unwrap();
        let paid = b.withdraw(l1, wad(50), 0, &mut events).unwrap();
        assert_eq!(paid, wad(45));
        assert_eq!(b.permanent_loss_scaled, wad(5));
    }

    #[test]
    fn test_pay_back_permanent_loss() {
        let mut b = bucket(0);
        let mut events = Vec::new();
        b.deposit(Address::repeat_byte(1), wad(50), 0, &mut events).unwrap();
        b.register_permanent_loss(wad(3), &mut events).unwrap();

        let applied = b.pay_back_permanent_loss(wad(5), 0, &mut events).unwrap();
        assert_eq!(applied, wad(3));
        assert_eq!(b.permanent_loss_scaled, U256::ZERO);
        assert_eq!(b.available_liquidity, wad(53));
    }

    #[test]
    fn test_delisting() {
        let mut b = bucket(0);
        let mut events = Vec::new();
        assert_eq!(b.delist(10, &mut events).unwrap(), 110);
        assert!(b.is_delisted());
        assert!(!b.is_delisting_deadline_passed(110));
        assert!(b.is_delisting_deadline_passed(111));
        assert!(matches!(
            b.deposit(Address::repeat_byte(1), wad(1), 20, &mut events),
            Err(MarginError::BucketDelisted(_))
        ));
        assert!(b.delist(20, &mut events).is_err());
    }

    #[test]
    fn test_deposit_cap() {
        let mut b = bucket(0);
        b.params.max_total_deposit = wad(10);
        let mut events = Vec::new();
        b.deposit(Address::repeat_byte(1), wad(10), 0, &mut events).unwrap();
        assert!(matches!(
            b.deposit(Address::repeat_byte(1), wad(1), 0, &mut events),
            Err(MarginError::DepositCapExceeded { .. })
        ));
    }

    #[test]
    fn test_max_asset_leverage() {
        let mut b = bucket(0);
        b.params.fee_buffer = WAD;
        // no discounts: unbounded
        assert_eq!(
            b.max_asset_leverage(U256::ZERO, U256::ZERO, U256::ZERO, U256::ZERO)
                .unwrap(),
            U256::MAX
        );
        // 1 / (1 - 0.9) = 10x
        let lev = b
            .max_asset_leverage(WAD / U256::from(10u64), U256::ZERO, U256::ZERO, U256::ZERO)
            .unwrap();
        assert_eq!(lev, wad(10));
    }
}
