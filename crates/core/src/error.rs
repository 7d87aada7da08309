//! Protocol error taxonomy.

use alloy::primitives::{Address, U256};
use margin_chain::{OracleError, VaultError};
use margin_dex::{DexError, RouteError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conditions::ConditionKind;
use crate::events::CloseReason;
use crate::u256_math::MathError;

pub type MarginResult<T> = Result<T, MarginError>;

/// Failure class. Every class reverts the whole call; the class tells the
/// caller whether resubmitting with adjusted parameters can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed input
    Validation,
    /// Wrong or blacklisted caller
    Authorization,
    /// Market conditions or position state reject the call
    Economic,
    /// Caller passed references that do not line up with protocol state
    Bookkeeping,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarginError {
    // Validation
    #[error("amount must be non-zero")]
    ZeroAmount,

    #[error("position id list is empty")]
    EmptyIds,

    #[error("duplicate position id {0}")]
    DuplicatePositionId(u64),

    #[error("invalid swap route: {0}")]
    InvalidRoute(#[from] RouteError),

    #[error("amount {amount} must be below the position amount {position_amount}")]
    AmountNotBelowPosition { amount: U256, position_amount: U256 },

    #[error("malformed {kind:?} condition parameters ({len} bytes)")]
    InvalidConditionParams { kind: ConditionKind, len: usize },

    #[error("condition index {index} out of range ({len} conditions)")]
    ConditionIndexOutOfRange { index: usize, len: usize },

    #[error("{ids} positions but {indexes} condition indexes")]
    ConditionIndexesMismatch { ids: usize, indexes: usize },

    #[error("deadline {deadline} passed at {now}")]
    DeadlinePassed { deadline: u64, now: u64 },

    #[error("spot positions cannot borrow")]
    SpotBorrow,

    #[error("operation requires a margin position, {0} is spot")]
    NotMarginPosition(u64),

    #[error("close reason {0:?} is not supported on this path")]
    UnsupportedCloseReason(CloseReason),

    #[error("decrease {amount} must be below the deposit {deposit}")]
    DecreaseNotBelowDeposit { amount: U256, deposit: U256 },

    // Authorization
    #[error("{caller} is not the trader of position {id}")]
    CallerIsNotTrader { id: u64, caller: Address },

    #[error("{0} is blacklisted")]
    Blacklisted(Address),

    // Economic
    #[error(transparent)]
    Dex(DexError),

    #[error("dex output {amount_out} below oracle-tolerated minimum {min_expected}")]
    DifferentPriceDexAndOracle { amount_out: U256, min_expected: U256 },

    #[error("position {id} is not eligible for {reason:?}")]
    PositionNotEligible { id: u64, reason: CloseReason },

    #[error("close condition {index} of position {id} is not met")]
    ConditionNotMet { id: u64, index: usize },

    #[error("position size {value_usd} USD (WAD) below minimum {min_usd}")]
    PositionTooSmall { value_usd: U256, min_usd: U256 },

    #[error("position size {value_usd} USD (WAD) above maximum {max_usd}")]
    PositionTooLarge { value_usd: U256, max_usd: U256 },

    #[error("health {health} below required {required}")]
    InsufficientHealth { health: U256, required: U256 },

    #[error("leverage {leverage} above bucket maximum {max}")]
    LeverageExceeded { leverage: U256, max: U256 },

    #[error("insufficient bucket liquidity: available {available}, requested {requested}")]
    InsufficientLiquidity { available: U256, requested: U256 },

    #[error("bucket deposit cap exceeded: {total} > {cap}")]
    DepositCapExceeded { total: U256, cap: U256 },

    #[error("bucket {0} is delisted")]
    BucketDelisted(Address),

    #[error("bucket {bucket} delisting deadline not passed")]
    DelistingDeadlineNotPassed { bucket: Address },

    #[error("minimum protocol fee {min_fee} exceeds payment amount {payment}")]
    MinFeeExceedsPayment { min_fee: U256, payment: U256 },

    #[error("proceeds {amount_out} do not cover debt {debt}")]
    ProceedsBelowDebt { amount_out: U256, debt: U256 },

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    // Bookkeeping
    #[error("position {0} not found")]
    PositionNotFound(u64),

    #[error("bucket {0} not found")]
    BucketNotFound(Address),

    #[error("bucket {0} already exists")]
    BucketExists(Address),

    #[error("bucket {0} already delisted")]
    AlreadyDelisted(Address),

    #[error("asset {asset} is not allowed in bucket {bucket}")]
    AssetNotAllowed { bucket: Address, asset: Address },

    #[error("position {id} does not belong to the requested bucket")]
    BucketMismatch { id: u64 },

    #[error("position {id} assets do not match the batch")]
    AssetMismatch { id: u64 },

    #[error("sold asset {sold_asset} differs from bucket asset {bucket_asset}")]
    SoldAssetMismatch {
        sold_asset: Address,
        bucket_asset: Address,
    },

    #[error("scaled balance of {holder} is {held}, cannot burn {requested}")]
    InsufficientScaledBalance {
        holder: Address,
        held: U256,
        requested: U256,
    },

    #[error(transparent)]
    Math(#[from] MathError),
}

impl From<DexError> for MarginError {
    fn from(err: DexError) -> Self {
        match err {
            DexError::Route(route) => Self::InvalidRoute(route),
            other => Self::Dex(other),
        }
    }
}

impl MarginError {
    pub fn kind(&self) -> ErrorKind {
        use MarginError::*;
        match self {
            ZeroAmount
            | EmptyIds
            | DuplicatePositionId(_)
            | InvalidRoute(_)
            | AmountNotBelowPosition { .. }
            | InvalidConditionParams { .. }
            | ConditionIndexOutOfRange { .. }
            | ConditionIndexesMismatch { .. }
            | DeadlinePassed { .. }
            | SpotBorrow
            | NotMarginPosition(_)
            | UnsupportedCloseReason(_)
            | DecreaseNotBelowDeposit { .. } => ErrorKind::Validation,

            CallerIsNotTrader { .. } | Blacklisted(_) => ErrorKind::Authorization,

            Dex(_)
            | DifferentPriceDexAndOracle { .. }
            | PositionNotEligible { .. }
            | ConditionNotMet { .. }
            | PositionTooSmall { .. }
            | PositionTooLarge { .. }
            | InsufficientHealth { .. }
            | LeverageExceeded { .. }
            | InsufficientLiquidity { .. }
            | DepositCapExceeded { .. }
            | BucketDelisted(_)
            | DelistingDeadlineNotPassed { .. }
            | MinFeeExceedsPayment { .. }
            | ProceedsBelowDebt { .. }
            | Vault(_)
            | Oracle(_) => ErrorKind::Economic,

            PositionNotFound(_)
            | BucketNotFound(_)
            | BucketExists(_)
            | AlreadyDelisted(_)
            | AssetNotAllowed { .. }
            | BucketMismatch { .. }
            | AssetMismatch { .. }
            | SoldAssetMismatch { .. }
            | InsufficientScaledBalance { .. }
            | Math(_) => ErrorKind::Bookkeeping,
        }
    }

    /// Whether resubmitting with adjusted parameters can succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Economic
    }
}
