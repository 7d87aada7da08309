//! Market loader: buckets and pair parameters from TOML.
//!
//! ```toml
//! [[buckets]]
//! name = "usdc-main"
//! asset = "${USDC_ADDRESS}"
//! allowed_assets = ["0x...", "0x..."]
//! fee_buffer = 1.0005
//! reserve_rate_bps = 1000
//!
//! [[pairs]]
//! asset_a = "${USDC_ADDRESS}"
//! asset_b = "0x..."
//! oracle_tolerable_limit_bps = 80
//! ```

use alloy::primitives::{keccak256, Address, U256};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::info;

use crate::bucket::BucketParams;
use crate::interest::RateModelParams;
use crate::u256_math::{self, RAY};

/// Raw market file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketConfig {
    #[serde(default)]
    pub buckets: Vec<BucketEntry>,
    #[serde(default)]
    pub pairs: Vec<PairEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketEntry {
    pub name: String,
    /// Derived from the name when absent
    #[serde(default)]
    pub address: Option<String>,
    pub asset: String,
    #[serde(default)]
    pub allowed_assets: Vec<String>,
    #[serde(default = "default_fee_buffer")]
    pub fee_buffer: f64,
    #[serde(default = "default_reserve_rate")]
    pub reserve_rate_bps: u32,
    #[serde(default = "default_base_rate")]
    pub base_rate_bps: u32,
    #[serde(default = "default_slope1")]
    pub slope1_bps: u32,
    #[serde(default = "default_slope2")]
    pub slope2_bps: u32,
    #[serde(default = "default_optimal_utilization")]
    pub optimal_utilization_bps: u32,
    /// Whole tokens, 0 = unbounded
    #[serde(default)]
    pub max_total_deposit: f64,
    #[serde(default = "default_delisting_period")]
    pub delisting_deadline_period_secs: u64,
}

fn default_fee_buffer() -> f64 {
    1.0005
}
fn default_reserve_rate() -> u32 {
    1_000
}
fn default_base_rate() -> u32 {
    200
}
fn default_slope1() -> u32 {
    800
}
fn default_slope2() -> u32 {
    10_000
}
fn default_optimal_utilization() -> u32 {
    8_000
}
fn default_delisting_period() -> u64 {
    7 * 24 * 3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairEntry {
    pub asset_a: String,
    pub asset_b: String,
    pub oracle_tolerable_limit_bps: u32,
}

/// Markets with every address resolved.
#[derive(Debug, Clone, Default)]
pub struct ResolvedMarkets {
    pub buckets: Vec<BucketParams>,
    /// Unordered pair -> WAD tolerance
    pair_tolerances: HashMap<(Address, Address), U256>,
}

impl ResolvedMarkets {
    pub fn set_pair_tolerance(&mut self, a: Address, b: Address, tolerance: U256) {
        self.pair_tolerances.insert(pair_key(a, b), tolerance);
    }

    /// Pair tolerance, or `default` when the pair has no entry.
    pub fn oracle_tolerable_limit(&self, a: Address, b: Address, default: U256) -> U256 {
        self.pair_tolerances
            .get(&pair_key(a, b))
            .copied()
            .unwrap_or(default)
    }
}

fn pair_key(a: Address, b: Address) -> (Address, Address) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Loader resolving a [`MarketConfig`] into protocol parameters.
pub struct MarketLoader {
    treasury: Address,
}

impl MarketLoader {
    /// Reserve credit of every bucket is minted to `treasury`.
    pub fn new(treasury: Address) -> Self {
        Self { treasury }
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ResolvedMarkets> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read market config: {}", path.display()))?;
        self.load_str(&content)
            .with_context(|| format!("Invalid market config: {}", path.display()))
    }

    pub fn load_str(&self, content: &str) -> Result<ResolvedMarkets> {
        let config: MarketConfig =
            toml::from_str(content).context("Failed to parse market config")?;
        self.resolve(&config)
    }

    pub fn resolve(&self, config: &MarketConfig) -> Result<ResolvedMarkets> {
        let mut markets = ResolvedMarkets::default();

        for entry in &config.buckets {
            let params = self
                .resolve_bucket(entry)
                .with_context(|| format!("Bucket '{}'", entry.name))?;
            info!(
                bucket = %entry.name,
                address = %params.address,
                asset = %params.asset,
                allowed = params.allowed_assets.len(),
                "Resolved bucket"
            );
            markets.buckets.push(params);
        }

        for pair in &config.pairs {
            let a = parse_address(&pair.asset_a).context("Pair asset_a")?;
            let b = parse_address(&pair.asset_b).context("Pair asset_b")?;
            markets.set_pair_tolerance(a, b, u256_math::bps_to_wad(pair.oracle_tolerable_limit_bps));
        }

        Ok(markets)
    }

    fn resolve_bucket(&self, entry: &BucketEntry) -> Result<BucketParams> {
        let address = match &entry.address {
            Some(raw) => parse_address(raw).context("Bucket address")?,
            None => Address::from_word(keccak256(entry.name.as_bytes())),
        };
        let asset = parse_address(&entry.asset).context("Bucket asset")?;
        let allowed_assets = entry
            .allowed_assets
            .iter()
            .map(|raw| parse_address(raw))
            .collect::<Result<BTreeSet<_>>>()
            .context("Allowed assets")?;

        if entry.fee_buffer < 1.0 {
            anyhow::bail!("fee_buffer must be at least 1.0, got {}", entry.fee_buffer);
        }
        if entry.reserve_rate_bps > 10_000 || entry.optimal_utilization_bps > 10_000 {
            anyhow::bail!("reserve rate and optimal utilization must not exceed 10000 bps");
        }

        Ok(BucketParams {
            name: entry.name.clone(),
            address,
            asset,
            allowed_assets,
            fee_buffer: u256_math::f64_to_wad(entry.fee_buffer),
            reserve_rate: u256_math::bps_to_wad(entry.reserve_rate_bps),
            rate_params: RateModelParams {
                base_rate: bps_to_ray(entry.base_rate_bps),
                slope1: bps_to_ray(entry.slope1_bps),
                slope2: bps_to_ray(entry.slope2_bps),
                optimal_utilization: bps_to_ray(entry.optimal_utilization_bps),
            },
            max_total_deposit: u256_math::f64_to_wad(entry.max_total_deposit),
            delisting_deadline_period: entry.delisting_deadline_period_secs,
            treasury: self.treasury,
        })
    }
}

fn bps_to_ray(bps: u32) -> U256 {
    RAY / U256::from(10_000u32) * U256::from(bps)
}

/// Parse an address, expanding a `${VAR}` reference from the environment.
fn parse_address(raw: &str) -> Result<Address> {
    let value = match raw.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        Some(var) => std::env::var(var).map_err(|_| anyhow::anyhow!("Missing env var: {}", var))?,
        None => raw.to_string(),
    };
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", value, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::u256_math::WAD;

    const USDC: &str = "0x1111111111111111111111111111111111111111";
    const WETH: &str = "0x2222222222222222222222222222222222222222";

    #[test]
    fn test_load_markets() {
        let toml = format!(
            r#"
            [[buckets]]
            name = "usdc-main"
            asset = "{USDC}"
            allowed_assets = ["{WETH}"]
            fee_buffer = 1.0
            base_rate_bps = 500
            max_total_deposit = 1000.0

            [[pairs]]
            asset_a = "{WETH}"
            asset_b = "{USDC}"
            oracle_tolerable_limit_bps = 80
            "#
        );
        let markets = MarketLoader::new(Address::ZERO).load_str(&toml).unwrap();
        assert_eq!(markets.buckets.len(), 1);

        let bucket = &markets.buckets[0];
        assert_eq!(bucket.address, Address::from_word(keccak256(b"usdc-main")));
        assert_eq!(bucket.fee_buffer, WAD);
        assert_eq!(bucket.rate_params.base_rate, RAY / U256::from(20u64));
        assert_eq!(bucket.max_total_deposit, U256::from(1000u64) * WAD);
        assert_eq!(bucket.delisting_deadline_period, 7 * 24 * 3600);

        let usdc: Address = USDC.parse().unwrap();
        let weth: Address = WETH.parse().unwrap();
        assert_eq!(
            markets.oracle_tolerable_limit(usdc, weth, U256::ZERO),
            u256_math::bps_to_wad(80)
        );
        assert_eq!(
            markets.oracle_tolerable_limit(usdc, Address::ZERO, U256::from(7u64)),
            U256::from(7u64)
        );
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("MARGIN_TEST_BUCKET_ASSET", USDC);
        let addr = parse_address("${MARGIN_TEST_BUCKET_ASSET}").unwrap();
        assert_eq!(addr, USDC.parse::<Address>().unwrap());
        assert!(parse_address("${MARGIN_TEST_UNSET_VAR}").is_err());
    }

    #[test]
    fn test_rejects_bad_fee_buffer() {
        let toml = format!(
            r#"
            [[buckets]]
            name = "bad"
            asset = "{USDC}"
            fee_buffer = 0.9
            "#
        );
        assert!(MarketLoader::new(Address::ZERO).load_str(&toml).is_err());
    }
}
