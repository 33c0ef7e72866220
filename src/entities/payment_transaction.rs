use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether money moved toward the store or back to the shopper.
#[derive(
    Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum TransactionType {
    #[sea_orm(string_value = "Charge")]
    Charge,
    #[sea_orm(string_value = "Refund")]
    Refund,
}

/// Ledger status of a payment transaction. `Success` and `Failed` are
/// terminal; terminal rows are never mutated again.
#[derive(
    Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum TransactionStatus {
    /// Waiting for the shopper to complete the gateway flow.
    #[sea_orm(string_value = "PendingUserAction")]
    PendingUserAction,
    #[sea_orm(string_value = "Success")]
    Success,
    #[sea_orm(string_value = "Failed")]
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Success | TransactionStatus::Failed)
    }
}

/// The `payment_transactions` table: the append-mostly payment ledger. Every
/// charge attempt and refund gets its own row; failed attempts stay on record.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub order_id: Uuid,
    pub transaction_type: TransactionType,

    /// Amount in whole currency units.
    pub amount: Decimal,

    /// Amount in the gateway's smallest currency unit. This is the figure
    /// that gets signed and the one callbacks are checked against.
    pub amount_minor: i64,

    pub status: TransactionStatus,

    /// Adapter kind that handled this transaction ("redirect" | "card").
    pub gateway: String,

    /// Transaction reference assigned by the gateway, once known.
    pub external_transaction_id: Option<String>,

    /// Opaque gateway payload. For charges this holds at least the redirect
    /// URL handed to the shopper.
    #[sea_orm(column_type = "Json")]
    pub gateway_payload: Option<serde_json::Value>,

    /// Gateway result code for failed transactions.
    pub failure_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Order,

    #[sea_orm(has_many = "super::invoice::Entity")]
    Invoices,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl Related<super::invoice::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Invoices.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Creates a pending charge row for a fresh payment attempt. The id is
    /// caller-supplied because it doubles as the gateway order reference and
    /// is claimed on the order before this row exists.
    pub fn new_charge(id: Uuid, order_id: Uuid, amount: Decimal, amount_minor: i64, gateway: String) -> Self {
        Self {
            id,
            order_id,
            transaction_type: TransactionType::Charge,
            amount,
            amount_minor,
            status: TransactionStatus::PendingUserAction,
            gateway,
            external_transaction_id: None,
            gateway_payload: None,
            failure_reason: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Creates a completed refund row. Refunds are ledger facts recorded
    /// against the original charge; there is no pending phase.
    pub fn new_refund(
        order_id: Uuid,
        amount: Decimal,
        amount_minor: i64,
        gateway: String,
        external_transaction_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_id,
            transaction_type: TransactionType::Refund,
            amount,
            amount_minor,
            status: TransactionStatus::Success,
            gateway,
            external_transaction_id,
            gateway_payload: None,
            failure_reason: None,
            created_at: now,
            completed_at: Some(now),
        }
    }
}
