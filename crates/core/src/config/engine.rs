//! Engine configuration with profile support.
//!
//! Risk buffers and fee schedules for the position lifecycle, with
//! `testing` and `production` profiles selectable through `MARGIN_PROFILE`.

use alloy::primitives::Address;
use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::fees::FeeRateType;

/// Main configuration structure for the protocol engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// Risk buffers and position size bounds
    #[serde(default)]
    pub position: PositionConfig,

    /// Protocol fee schedule
    #[serde(default)]
    pub fees: FeeConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Risk buffers and size bounds applied to every position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionConfig {
    /// Security buffer discounting position value in the health formula
    #[serde(default = "default_security_buffer")]
    pub security_buffer_bps: u32,

    /// Extra health required above one when a position is opened or its
    /// deposit decreased
    #[serde(default = "default_maintenance_buffer")]
    pub maintenance_buffer_bps: u32,

    /// Oracle tolerance for pairs without their own entry
    #[serde(default = "default_oracle_tolerable_limit")]
    pub default_oracle_tolerable_limit_bps: u32,

    /// Tolerance multiplier granted to trusted callers
    #[serde(default = "default_trusted_multiplier")]
    pub trusted_tolerable_limit_multiplier: u32,

    /// Minimum position notional (USD)
    #[serde(default = "default_min_position_size")]
    pub min_position_size_usd: f64,

    /// Maximum position notional (USD), 0 = unbounded
    #[serde(default = "default_max_position_size")]
    pub max_position_size_usd: f64,
}

fn default_security_buffer() -> u32 {
    50
}
fn default_maintenance_buffer() -> u32 {
    100
}
fn default_oracle_tolerable_limit() -> u32 {
    100
}
fn default_trusted_multiplier() -> u32 {
    2
}
fn default_min_position_size() -> f64 {
    10.0
}
fn default_max_position_size() -> f64 {
    0.0
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            security_buffer_bps: default_security_buffer(),
            maintenance_buffer_bps: default_maintenance_buffer(),
            default_oracle_tolerable_limit_bps: default_oracle_tolerable_limit(),
            trusted_tolerable_limit_multiplier: default_trusted_multiplier(),
            min_position_size_usd: default_min_position_size(),
            max_position_size_usd: default_max_position_size(),
        }
    }
}

/// Protocol fee schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    #[serde(default = "default_margin_trader_fee")]
    pub margin_closed_by_trader_bps: u32,

    #[serde(default = "default_spot_trader_fee")]
    pub spot_closed_by_trader_bps: u32,

    #[serde(default = "default_keeper_fee")]
    pub margin_closed_by_keeper_bps: u32,

    #[serde(default = "default_keeper_fee")]
    pub spot_closed_by_keeper_bps: u32,

    /// Fee discount per trader tier (index = tier)
    #[serde(default)]
    pub tier_discounts_bps: Vec<u32>,

    #[serde(default = "default_min_fee")]
    pub min_protocol_fee_usd: f64,

    /// 0 = no cap
    #[serde(default)]
    pub max_protocol_fee_usd: f64,

    /// Multiplier applied to fees paid in the discount token
    #[serde(default = "default_discount_multiplier")]
    pub discount_multiplier_bps: u32,

    #[serde(default)]
    pub discount_token: Option<Address>,

    /// Receives fees, liquidation remainders and rounding residuals
    #[serde(default)]
    pub treasury: Address,
}

fn default_margin_trader_fee() -> u32 {
    50
}
fn default_spot_trader_fee() -> u32 {
    20
}
fn default_keeper_fee() -> u32 {
    100
}
fn default_min_fee() -> f64 {
    0.5
}
fn default_discount_multiplier() -> u32 {
    7_000
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            margin_closed_by_trader_bps: default_margin_trader_fee(),
            spot_closed_by_trader_bps: default_spot_trader_fee(),
            margin_closed_by_keeper_bps: default_keeper_fee(),
            spot_closed_by_keeper_bps: default_keeper_fee(),
            tier_discounts_bps: Vec::new(),
            min_protocol_fee_usd: default_min_fee(),
            max_protocol_fee_usd: 0.0,
            discount_multiplier_bps: default_discount_multiplier(),
            discount_token: None,
            treasury: Address::ZERO,
        }
    }
}

impl FeeConfig {
    pub fn rate_bps(&self, rate_type: FeeRateType) -> u32 {
        match rate_type {
            FeeRateType::MarginPositionClosedByTrader => self.margin_closed_by_trader_bps,
            FeeRateType::SpotPositionClosedByTrader => self.spot_closed_by_trader_bps,
            FeeRateType::MarginPositionClosedByKeeper => self.margin_closed_by_keeper_bps,
            FeeRateType::SpotPositionClosedByKeeper => self.spot_closed_by_keeper_bps,
        }
    }

    /// Discount for `tier`; tiers past the table get the last entry.
    pub fn tier_discount_bps(&self, tier: u8) -> u32 {
        self.tier_discounts_bps
            .get(tier as usize)
            .or_else(|| self.tier_discounts_bps.last())
            .copied()
            .unwrap_or(0)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            position: PositionConfig::default(),
            fees: FeeConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config: {}", path))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse engine config: {}", path))?;
        Ok(config)
    }

    /// Permissive profile for simulations and tests: no size bounds, no
    /// minimum fee.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            position: PositionConfig {
                security_buffer_bps: 0,
                maintenance_buffer_bps: 0,
                default_oracle_tolerable_limit_bps: 500, // 5%
                trusted_tolerable_limit_multiplier: 2,
                min_position_size_usd: 0.0,
                max_position_size_usd: 0.0,
            },
            fees: FeeConfig {
                min_protocol_fee_usd: 0.0,
                ..FeeConfig::default()
            },
        }
    }

    /// Conservative production profile.
    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            position: PositionConfig {
                security_buffer_bps: 100,
                maintenance_buffer_bps: 200,
                default_oracle_tolerable_limit_bps: 50,
                trusted_tolerable_limit_multiplier: 3,
                min_position_size_usd: 25.0,
                max_position_size_usd: 5_000_000.0,
            },
            fees: FeeConfig {
                min_protocol_fee_usd: 1.0,
                max_protocol_fee_usd: 10_000.0,
                ..FeeConfig::default()
            },
        }
    }

    /// Get profile from environment variable MARGIN_PROFILE, or default.
    /// Supported values: testing, production
    pub fn from_env() -> Self {
        let profile = std::env::var("MARGIN_PROFILE").unwrap_or_else(|_| "default".to_string());
        match profile.to_lowercase().as_str() {
            "testing" | "test" => Self::testing(),
            "production" | "prod" => Self::production(),
            _ => Self::default(),
        }
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Engine configuration loaded");
        tracing::info!(
            security_buffer_bps = self.position.security_buffer_bps,
            maintenance_buffer_bps = self.position.maintenance_buffer_bps,
            oracle_tolerance_bps = self.position.default_oracle_tolerable_limit_bps,
            min_size_usd = self.position.min_position_size_usd,
            max_size_usd = self.position.max_position_size_usd,
            "Position risk parameters"
        );
        tracing::info!(
            margin_trader_bps = self.fees.margin_closed_by_trader_bps,
            margin_keeper_bps = self.fees.margin_closed_by_keeper_bps,
            min_fee_usd = self.fees.min_protocol_fee_usd,
            max_fee_usd = self.fees.max_protocol_fee_usd,
            treasury = %self.fees.treasury,
            "Fee schedule"
        );
    }
}
