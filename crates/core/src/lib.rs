//! Margin protocol core.
//!
//! This crate provides the accounting and liquidation core of a leveraged
//! margin-trading protocol:
//! - Fixed-point WAD/RAY math with explicit rounding
//! - Scaled debt and credit tokens over lazily accrued interest indices
//! - Single-asset lending buckets with permanent-loss tracking and delisting
//! - Position lifecycle: open, close, keeper close, partial close and
//!   deposit adjustments
//! - Batch closes against one aggregate swap with pro-rata settlement
//!
//! Swap routing lives in `margin-dex`; oracle, vault, keeper rewards and
//! access control are seams in `margin-chain`.

mod batch_manager;
mod bucket;
mod conditions;
pub mod config;
mod error;
mod events;
mod fees;
mod interest;
mod position;
mod position_manager;
mod position_tracker;
mod protocol;
mod scaled;
mod settlement;
pub mod u256_math;

pub use batch_manager::{BatchOutcome, CloseBatchParams};
pub use bucket::{Bucket, BucketParams};
pub use conditions::{
    CloseCondition, ConditionContext, ConditionKind, ConditionRegistry, TriggerLeg,
};
pub use config::{EngineConfig, MarketLoader, ResolvedMarkets};
pub use error::{ErrorKind, MarginError, MarginResult};
pub use events::{CloseReason, EventLog, ProtocolEvent};
pub use fees::{FeeRateType, FeeSplit};
pub use interest::{InterestRateStrategy, KinkedRateStrategy, RateModelParams};
pub use position::{health_ratio, is_risky, HealthParams, Position};
pub use position_manager::{
    CloseByConditionParams, ClosePositionParams, DecreaseDepositParams, IncreaseDepositParams,
    OpenPositionParams, PartialCloseParams,
};
pub use position_tracker::{PositionTracker, TrackerStats};
pub use protocol::{CallContext, MarginProtocol, Services};
pub use scaled::{CreditToken, DebtToken, ScaledLedger};
pub use settlement::{pro_rata, settle, CloseOutcome, Remainder};
