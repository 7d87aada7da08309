//! End-to-end lending, lifecycle and liquidation scenarios.

mod common;

use alloy::primitives::U256;
use common::*;
use margin_chain::{BalanceVault, KeeperActionType, OracleData, PriceOracle, PullUpdate};
use margin_core::u256_math::WAD;
use margin_core::{
    CloseBatchParams, CloseByConditionParams, CloseReason, MarginError, PartialCloseParams,
    ProtocolEvent,
};

fn keeper_close(id: u64, reason: CloseReason) -> CloseByConditionParams {
    CloseByConditionParams {
        id,
        routes: sell_route(),
        condition_index: 0,
        reason,
        oracle_data: OracleData::none(),
    }
}

fn liquidation_batch(ids: Vec<u64>) -> CloseBatchParams {
    CloseBatchParams {
        ids,
        routes: sell_route(),
        position_asset: weth(),
        sold_asset: usdc(),
        bucket: Some(bucket()),
        condition_indexes: Vec::new(),
        reason: CloseReason::BatchLiquidation,
        oracle_data: OracleData::none(),
    }
}

#[test]
fn test_interest_accrues_and_close_repays_pool() {
    let mut h = HarnessBuilder::new()
        .borrow_rate_pct(10)
        .liquidity(wad(50))
        .build();
    let id = h.open(0, wad(25), wad(25));
    assert_eq!(h.protocol.bucket(bucket()).unwrap().available_liquidity, wad(25));

    let debt = h.protocol.position_debt(id, YEAR).unwrap();
    assert!(debt > wad(25));
    // Viewing the debt does not accrue the bucket.
    assert_eq!(h.protocol.bucket(bucket()).unwrap().last_accrual, 0);

    let outcome = h
        .protocol
        .close_position(at(trader(), YEAR), &close_params(id))
        .unwrap();
    assert_eq!(outcome.debt, debt);
    assert_eq!(outcome.repaid, debt);

    let bucket = h.protocol.bucket(bucket()).unwrap();
    assert_eq!(bucket.available_liquidity, wad(25) + debt);
    assert!(bucket.debt_token().ledger().scaled_total_supply().is_zero());
    assert!(bucket.total_credit().unwrap() > wad(50));
}

#[test]
fn test_round_trip_costs_only_the_fee() {
    let mut h = HarnessBuilder::new().build();
    let id = h.open(0, wad(20), wad(20));
    let outcome = h
        .protocol
        .close_position(at(trader(), 0), &close_params(id))
        .unwrap();

    // 0.5% of 40
    let fee = frac(1, 5);
    assert_eq!(outcome.amount_out, wad(40));
    assert_eq!(outcome.fee, fee);
    assert_eq!(outcome.to_trader, wad(20) - fee);
    assert_eq!(-outcome.profit, margin_core::u256_math::to_signed(fee).unwrap());
    assert_eq!(h.protocol.vault().available(treasury(), usdc()), fee);
}

#[test]
fn test_batch_liquidation() {
    let mut h = HarnessBuilder::new().build();
    let first = h.open(0, wad(10), wad(30));
    let second = h.open(0, wad(10), wad(30));
    assert_eq!(h.protocol.trader_position_count(trader()), 2);

    h.set_price(frac(155, 100));
    let batch = h
        .protocol
        .close_batch(at(keeper(), 1), &liquidation_batch(vec![first, second]))
        .unwrap();

    assert_eq!(batch.amount_out, wad(62));
    assert_eq!(batch.residual, U256::ZERO);
    for (_, outcome) in &batch.closed {
        assert_eq!(outcome.amount_out, wad(31));
        assert_eq!(outcome.repaid, wad(30));
        assert_eq!(outcome.to_treasury, wad(1));
        assert_eq!(outcome.to_trader, U256::ZERO);
    }
    assert_eq!(h.protocol.trader_position_count(trader()), 0);
    assert_eq!(h.protocol.events().closes().count(), 2);
    assert_eq!(h.protocol.vault().available(treasury(), usdc()), wad(2));
    assert_eq!(h.rewards.actions_of(keeper()), 2);
    assert_eq!(h.rewards.updates().len(), 1);
}

#[test]
fn test_batch_is_all_or_nothing() {
    let mut h = HarnessBuilder::new().build();
    let risky = h.open(0, wad(10), wad(30));
    let safe = h.open(0, wad(20), wad(20));
    h.set_price(frac(155, 100));

    let err = h
        .protocol
        .close_batch(at(keeper(), 1), &liquidation_batch(vec![risky, safe]))
        .unwrap_err();
    assert_eq!(
        err,
        MarginError::PositionNotEligible {
            id: safe,
            reason: CloseReason::BatchLiquidation
        }
    );
    assert_eq!(h.protocol.trader_position_count(trader()), 2);
    assert!(h.rewards.updates().is_empty());
}

#[test]
fn test_delisted_bucket_close_waits_for_deadline() {
    let mut h = HarnessBuilder::new().build();
    let id = h.open(0, wad(20), wad(20));
    let deadline = h.protocol.delist_bucket(at(lender(), 10), bucket()).unwrap();
    assert_eq!(deadline, 110);

    let err = h
        .protocol
        .close_position_by_condition(at(keeper(), 50), &keeper_close(id, CloseReason::BucketDelisted))
        .unwrap_err();
    assert_eq!(
        err,
        MarginError::PositionNotEligible {
            id,
            reason: CloseReason::BucketDelisted
        }
    );
    // The deadline itself is not yet past.
    assert!(h
        .protocol
        .close_position_by_condition(
            at(keeper(), 110),
            &keeper_close(id, CloseReason::BucketDelisted)
        )
        .is_err());

    let outcome = h
        .protocol
        .close_position_by_condition(
            at(keeper(), 111),
            &keeper_close(id, CloseReason::BucketDelisted),
        )
        .unwrap();
    assert_eq!(outcome.repaid, wad(20));
    assert!(outcome.to_trader > U256::ZERO);
    assert_eq!(h.rewards.updates()[0].action, KeeperActionType::BucketDelisted);
}

#[test]
fn test_healthy_position_on_delisted_bucket_waits_for_deadline() {
    let mut h = HarnessBuilder::new().build();
    let id = h.open(0, wad(20), wad(20));
    assert!(!h.protocol.is_risky(id, 0).unwrap());
    h.protocol.delist_bucket(at(lender(), 10), bucket()).unwrap();

    // Traders still have until the deadline to exit on their own.
    let err = h
        .protocol
        .close_position_by_condition(at(keeper(), 20), &keeper_close(id, CloseReason::RiskyPosition))
        .unwrap_err();
    assert_eq!(
        err,
        MarginError::PositionNotEligible {
            id,
            reason: CloseReason::RiskyPosition
        }
    );
    assert!(h.protocol.position(id).is_ok());
    assert_eq!(h.protocol.vault().available(treasury(), usdc()), U256::ZERO);

    let outcome = h
        .protocol
        .close_position_by_condition(at(keeper(), 111), &keeper_close(id, CloseReason::RiskyPosition))
        .unwrap();
    // Liquidation remainder goes to the treasury.
    assert_eq!(outcome.to_trader, U256::ZERO);
    assert_eq!(outcome.to_treasury, wad(20));
}

#[test]
fn test_batch_liquidation_on_delisted_bucket_waits_for_deadline() {
    let mut h = HarnessBuilder::new().build();
    let first = h.open(0, wad(20), wad(20));
    let second = h.open(0, wad(10), wad(10));
    h.protocol.delist_bucket(at(lender(), 10), bucket()).unwrap();

    let err = h
        .protocol
        .close_batch(at(keeper(), 20), &liquidation_batch(vec![first, second]))
        .unwrap_err();
    assert_eq!(
        err,
        MarginError::PositionNotEligible {
            id: first,
            reason: CloseReason::BatchLiquidation
        }
    );
    assert_eq!(h.protocol.trader_position_count(trader()), 2);

    let batch = h
        .protocol
        .close_batch(at(keeper(), 111), &liquidation_batch(vec![first, second]))
        .unwrap();
    assert_eq!(batch.closed.len(), 2);
    assert_eq!(h.protocol.trader_position_count(trader()), 0);
}

#[test]
fn test_reverted_liquidation_discards_pull_update() {
    let mut h = HarnessBuilder::new().build();
    let id = h.open(0, wad(20), wad(20));

    // The update still leaves the position healthy, so the call reverts.
    let mut params = keeper_close(id, CloseReason::RiskyPosition);
    params.oracle_data = OracleData {
        updates: vec![PullUpdate::encode(weth(), usdc(), frac(19, 10), U256::ZERO)],
        fee_paid: U256::ZERO,
    };
    let err = h
        .protocol
        .close_position_by_condition(at(keeper(), 1), &params)
        .unwrap_err();
    assert!(matches!(err, MarginError::PositionNotEligible { .. }));
    assert_eq!(h.oracle.rate(weth(), usdc()).unwrap(), wad(2));
}

#[test]
fn test_committed_call_applies_pull_update() {
    let mut h = HarnessBuilder::new().build();
    let id = h.open(0, wad(20), wad(20));

    let mut params = close_params(id);
    params.oracle_data = OracleData {
        updates: vec![PullUpdate::encode(weth(), usdc(), frac(201, 100), U256::ZERO)],
        fee_paid: U256::ZERO,
    };
    h.protocol
        .close_position(at(trader(), 1), &params)
        .unwrap();
    assert_eq!(h.oracle.rate(weth(), usdc()).unwrap(), frac(201, 100));
}

#[test]
fn test_delisted_bucket_rejects_new_positions() {
    let mut h = HarnessBuilder::new().build();
    h.protocol.delist_bucket(at(lender(), 10), bucket()).unwrap();
    let err = h
        .protocol
        .open_position(at(trader(), 11), &open_params(wad(10), wad(10)))
        .unwrap_err();
    assert_eq!(err, MarginError::BucketDelisted(bucket()));
}

#[test]
fn test_partial_close_scales_position() {
    let mut h = HarnessBuilder::new().build();
    let id = h.open(0, wad(20), wad(20));

    let outcome = h
        .protocol
        .partial_close_position(
            at(trader(), 0),
            &PartialCloseParams {
                id,
                amount: wad(2),
                receiver: trader(),
                routes: sell_route(),
                amount_out_min: U256::ZERO,
                deadline: u64::MAX,
                oracle_data: OracleData::none(),
            },
        )
        .unwrap();
    assert_eq!(outcome.amount_out, wad(4));
    assert_eq!(outcome.repaid, wad(2));

    let position = h.protocol.position(id).unwrap();
    assert_eq!(position.position_amount, wad(18));
    assert_eq!(position.deposit_amount_in_sold_asset, wad(18));
    assert_eq!(position.scaled_debt_amount, wad(18));
    assert_eq!(h.protocol.bucket(bucket()).unwrap().available_liquidity, wad(982));
}

#[test]
fn test_partial_close_of_whole_position_rejected() {
    let mut h = HarnessBuilder::new().build();
    let id = h.open(0, wad(20), wad(20));
    let err = h
        .protocol
        .partial_close_position(
            at(trader(), 0),
            &PartialCloseParams {
                id,
                amount: wad(20),
                receiver: trader(),
                routes: sell_route(),
                amount_out_min: U256::ZERO,
                deadline: u64::MAX,
                oracle_data: OracleData::none(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, MarginError::AmountNotBelowPosition { .. }));
}

#[test]
fn test_tracked_debt_matches_debt_token() {
    let mut h = HarnessBuilder::new().borrow_rate_pct(7).build();
    let a = h.open(0, wad(10), wad(10));
    let b = h.open(1_000, wad(15), wad(25));
    let c = h.open(86_400, wad(30), wad(5));

    h.protocol
        .partial_close_position(
            at(trader(), 90_000),
            &PartialCloseParams {
                id: b,
                amount: wad(7),
                receiver: trader(),
                routes: sell_route(),
                amount_out_min: U256::ZERO,
                deadline: u64::MAX,
                oracle_data: OracleData::none(),
            },
        )
        .unwrap();

    let before = h.protocol.positions().bucket_scaled_debt(bucket());
    let closed = h.protocol.position(a).unwrap().scaled_debt_amount;
    h.protocol
        .close_position(at(trader(), 100_000), &close_params(a))
        .unwrap();

    let tracked = h.protocol.positions().bucket_scaled_debt(bucket());
    assert_eq!(tracked, before - closed);
    let minted = h
        .protocol
        .bucket(bucket())
        .unwrap()
        .debt_token()
        .ledger()
        .scaled_total_supply();
    assert_eq!(tracked, minted);
    assert_eq!(h.protocol.bucket_position_ids(bucket()), vec![b, c]);
}

#[test]
fn test_health_boundary_with_zero_tolerance() {
    let mut h = HarnessBuilder::new().pair_tolerance(U256::ZERO).build();
    let id = h.open(0, wad(10), wad(30));

    // 20 WETH at 1.5 is worth exactly the debt.
    h.set_price(frac(3, 2));
    assert_eq!(h.protocol.health_ratio(id, 0).unwrap(), WAD);
    let err = h
        .protocol
        .close_position_by_condition(at(keeper(), 0), &keeper_close(id, CloseReason::RiskyPosition))
        .unwrap_err();
    assert!(matches!(err, MarginError::PositionNotEligible { .. }));

    h.set_price(frac(3, 2) - U256::from(1u64));
    assert!(h.protocol.is_risky(id, 0).unwrap());
    let outcome = h
        .protocol
        .close_position_by_condition(at(keeper(), 0), &keeper_close(id, CloseReason::RiskyPosition))
        .unwrap();
    assert_eq!(outcome.shortfall, U256::from(20u64));
    assert!(!h.protocol.bucket(bucket()).unwrap().permanent_loss_scaled.is_zero());
    assert!(h
        .protocol
        .events()
        .events()
        .iter()
        .any(|e| matches!(e, ProtocolEvent::PermanentLoss { .. })));
}

#[test]
fn test_batch_pro_rata_by_position_size() {
    let mut h = HarnessBuilder::new().build();
    let big = h.open(0, wad(20), wad(20));
    let small = h.open(0, wad(10), wad(10));

    // Odd price so the aggregate output does not split evenly.
    h.set_price(WAD + U256::from(7u64));
    let batch = h
        .protocol
        .close_batch(at(keeper(), 1), &liquidation_batch(vec![big, small]))
        .unwrap();

    let out_of = |id: u64| {
        batch
            .closed
            .iter()
            .find(|(closed, _)| *closed == id)
            .map(|(_, o)| o.amount_out)
            .unwrap()
    };
    let (big_out, small_out) = (out_of(big), out_of(small));
    let doubled = small_out * U256::from(2u64);
    let gap = if big_out > doubled {
        big_out - doubled
    } else {
        doubled - big_out
    };
    assert!(gap <= U256::from(1u64));
    assert!(big_out + small_out <= batch.amount_out);
    assert_eq!(batch.residual, batch.amount_out - big_out - small_out);
}

#[test]
fn test_blacklisted_trader_cannot_open() {
    let mut h = HarnessBuilder::new().build();
    h.access.blacklist(trader());
    let err = h
        .protocol
        .open_position(at(trader(), 0), &open_params(wad(10), wad(10)))
        .unwrap_err();
    assert_eq!(err, MarginError::Blacklisted(trader()));
    assert!(h.protocol.positions().is_empty());
}
