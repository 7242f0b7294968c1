//! Engine error taxonomy.
//!
//! One enum covers every failure the engine surfaces. Kinds map 1:1 to the
//! propagation policy: `Deadlock` is retried by the transaction coordinator,
//! `Duplicate` is success for closure paths, everything else rolls back and
//! propagates. The background loops (monitor, liquidator, reconciler) never
//! terminate on a single-cycle error.

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::types::{ParseEnumError, PositionId, PositionStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient margin: required {required}, free {free}")]
    InsufficientMargin { required: Decimal, free: Decimal },

    #[error("invalid transition {from:?} -> {to:?} for position {position_id}")]
    InvalidTransition {
        position_id: PositionId,
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error("invalid fill: {0}")]
    InvalidFill(String),

    #[error("duplicate idempotency key: {0}")]
    Duplicate(String),

    #[error("position not found: {0}")]
    PositionNotFound(PositionId),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("order tracker not found: {0}")]
    OrderNotFound(String),

    #[error("deadlock detected{}", .0.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    Deadlock(Option<String>),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("corrupt stored value: {0}")]
    Corrupt(#[from] ParseEnumError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Transient errors the caller (or C1) may safely retry
    pub fn retriable(&self) -> bool {
        matches!(self, EngineError::Deadlock(_) | EngineError::Timeout(_))
    }

    /// Stable machine-readable kind, used by the API error shape and the
    /// transaction audit log
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InsufficientMargin { .. } => "insufficient_margin",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::InvalidFill(_) => "invalid_fill",
            EngineError::Duplicate(_) => "duplicate",
            EngineError::PositionNotFound(_)
            | EngineError::AccountNotFound(_)
            | EngineError::OrderNotFound(_) => "not_found",
            EngineError::Deadlock(_) => "deadlock",
            EngineError::Timeout(_) => "timeout",
            EngineError::Cancelled(_) => "cancelled",
            EngineError::Broker(_) => "broker_error",
            EngineError::Integrity(_) => "integrity_violation",
            EngineError::Store(_) => "store_error",
            EngineError::Corrupt(_) => "corrupt_data",
            EngineError::Config(_) => "config_error",
        }
    }

    /// True when the underlying store reported a deadlock or serialization
    /// failure (Postgres 40P01 / 40001)
    pub fn is_deadlock(&self) -> bool {
        match self {
            EngineError::Deadlock(_) => true,
            EngineError::Store(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("40P01") | Some("40001"))
            }
            _ => false,
        }
    }
}

/// Structured error surfaced to API callers
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub kind: &'static str,
    pub message: String,
    pub retriable: bool,
}

impl From<&EngineError> for ApiError {
    fn from(err: &EngineError) -> Self {
        ApiError {
            kind: err.kind(),
            message: err.to_string(),
            retriable: err.retriable(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
