//! Shared harness for protocol integration tests.

#![allow(dead_code)]

use alloy::primitives::{Address, U256};
use margin_chain::{
    OracleData, RecordingRewardDistributor, StaticAccessGate, StaticOracle, StaticTiers,
    TraderBalanceVault, USD,
};
use margin_core::u256_math::{RAY, WAD};
use margin_core::{
    BucketParams, CallContext, ClosePositionParams, EngineConfig, MarginProtocol,
    OpenPositionParams, RateModelParams, ResolvedMarkets, Services,
};
use margin_dex::{ConstantRateVenue, MultiVenueRouter, RouteNode};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const VENUE: &str = "const";
pub const YEAR: u64 = 31_536_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .try_init();
}

pub fn wad(n: u64) -> U256 {
    U256::from(n) * WAD
}

/// `n / d` in WAD.
pub fn frac(n: u64, d: u64) -> U256 {
    U256::from(n) * WAD / U256::from(d)
}

pub fn usdc() -> Address {
    Address::repeat_byte(0xAA)
}

pub fn weth() -> Address {
    Address::repeat_byte(0xCC)
}

pub fn bucket() -> Address {
    Address::repeat_byte(0xB0)
}

pub fn treasury() -> Address {
    Address::repeat_byte(0xEE)
}

pub fn lender() -> Address {
    Address::repeat_byte(0x01)
}

pub fn trader() -> Address {
    Address::repeat_byte(0x02)
}

pub fn keeper() -> Address {
    Address::repeat_byte(0x03)
}

pub fn at(sender: Address, timestamp: u64) -> CallContext {
    CallContext::new(sender, timestamp)
}

pub struct Harness {
    pub protocol: MarginProtocol,
    pub oracle: Arc<StaticOracle>,
    pub venue: Arc<ConstantRateVenue>,
    pub rewards: Arc<RecordingRewardDistributor>,
    pub access: Arc<StaticAccessGate>,
}

pub struct HarnessBuilder {
    borrow_rate_pct: u64,
    liquidity: U256,
    markets: ResolvedMarkets,
    config: EngineConfig,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        let mut config = EngineConfig::testing();
        config.fees.treasury = treasury();
        Self {
            borrow_rate_pct: 0,
            liquidity: wad(1000),
            markets: ResolvedMarkets::default(),
            config,
        }
    }

    /// Fixed annual borrow rate regardless of utilization.
    pub fn borrow_rate_pct(mut self, pct: u64) -> Self {
        self.borrow_rate_pct = pct;
        self
    }

    pub fn liquidity(mut self, amount: U256) -> Self {
        self.liquidity = amount;
        self
    }

    pub fn pair_tolerance(mut self, tolerance: U256) -> Self {
        self.markets.set_pair_tolerance(weth(), usdc(), tolerance);
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut EngineConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// USDC bucket lending against WETH at 1 WETH = 2 USDC.
    pub fn build(mut self) -> Harness {
        init_tracing();

        let oracle = Arc::new(StaticOracle::new());
        let venue = Arc::new(ConstantRateVenue::new(VENUE, 0));
        let rewards = Arc::new(RecordingRewardDistributor::new());
        let access = Arc::new(StaticAccessGate::new());
        oracle.set_rate(usdc(), USD, WAD);

        self.markets.buckets.push(BucketParams {
            name: "usdc".into(),
            address: bucket(),
            asset: usdc(),
            allowed_assets: [weth()].into_iter().collect(),
            fee_buffer: WAD,
            reserve_rate: U256::ZERO,
            rate_params: RateModelParams::fixed(RAY * U256::from(self.borrow_rate_pct) / U256::from(100u64)),
            max_total_deposit: U256::ZERO,
            delisting_deadline_period: 100,
            treasury: treasury(),
        });

        let services = Services {
            oracle: oracle.clone(),
            router: Arc::new(MultiVenueRouter::new().with_venue(venue.clone())),
            rewards: rewards.clone(),
            access: access.clone(),
            tiers: Arc::new(StaticTiers::new()),
        };
        let mut protocol = MarginProtocol::new(
            self.config,
            self.markets,
            services,
            TraderBalanceVault::new(),
            0,
        )
        .expect("protocol");
        protocol
            .lender_deposit(at(lender(), 0), bucket(), self.liquidity)
            .expect("lender deposit");

        let harness = Harness {
            protocol,
            oracle,
            venue,
            rewards,
            access,
        };
        harness.set_price(wad(2));
        harness
    }
}

impl Harness {
    /// Move the WETH price on the oracle and the venue together.
    pub fn set_price(&self, usdc_per_weth: U256) {
        self.oracle.set_rate(weth(), usdc(), usdc_per_weth);
        self.oracle.set_rate(weth(), USD, usdc_per_weth);
        self.venue.set_rate(weth(), usdc(), usdc_per_weth);
    }

    pub fn open(&mut self, timestamp: u64, deposit: U256, borrowed: U256) -> u64 {
        self.protocol
            .open_position(at(trader(), timestamp), &open_params(deposit, borrowed))
            .expect("open position")
    }
}

pub fn buy_route() -> RouteNode {
    RouteNode::leg(VENUE, usdc(), weth())
}

pub fn sell_route() -> RouteNode {
    RouteNode::leg(VENUE, weth(), usdc())
}

pub fn open_params(deposit: U256, borrowed: U256) -> OpenPositionParams {
    OpenPositionParams {
        bucket: Some(bucket()),
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

pub fn close_params(id: u64) -> ClosePositionParams {
    ClosePositionParams {
        id,
        receiver: trader(),
        routes: sell_route(),
        amount_out_min: U256::ZERO,
        deadline: u64::MAX,
        oracle_data: OracleData::none(),
    }
}
