use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::order::OrderStatus;

/// Per-product shortage detail carried by stock rejections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockShortage {
    pub product_id: Uuid,
    pub requested: i32,
    pub available: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Insufficient stock for {} product(s)", .0.len())]
    InsufficientStock(Vec<StockShortage>),

    #[error("Rush delivery unavailable for {} product(s)", .0.len())]
    RushIneligible(Vec<Uuid>),

    #[error("Illegal order status transition: {from} -> {to}")]
    IllegalTransition { from: OrderStatus, to: OrderStatus },

    #[error("A payment is already in progress for order {0}")]
    PaymentAlreadyInProgress(Uuid),

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Payment gateway timed out")]
    GatewayTimeout,

    #[error("Payment gateway misconfigured: {0}")]
    GatewayConfig(String),

    #[error("Callback signature verification failed")]
    InvalidSignature,

    #[error("Callback amount {received_minor} does not match transaction amount {expected_minor}")]
    AmountMismatch {
        expected_minor: i64,
        received_minor: i64,
    },

    #[error("Unknown or stale payment transaction: {0}")]
    UnknownOrStaleTransaction(String),

    #[error("Stock commit failed for {} product(s)", .0.len())]
    StockCommitConflict(Vec<StockShortage>),

    #[error("Concurrent modification of {0}")]
    ConcurrentModification(Uuid),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

/// Normalizes the different database error inputs services produce.
pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// Security-relevant callback rejections. These must be logged and must
    /// never mutate order or transaction state.
    pub fn is_security_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature | Self::AmountMismatch { .. } | Self::UnknownOrStaleTransaction(_)
        )
    }

    /// Transient failures the caller may retry after a delay. The order is
    /// left in a state that permits a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GatewayUnavailable(_) | Self::GatewayTimeout | Self::ConcurrentModification(_)
        )
    }
}

// Historical alias kept for the db/config bootstrap layer.
pub type AppError = ServiceError;
