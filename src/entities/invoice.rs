use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The `invoices` table. One invoice per successful payment transaction;
/// rows are immutable.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "invoices")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub order_id: Uuid,

    /// The payment transaction this invoice documents. Unique: replayed
    /// callbacks must not produce a second invoice.
    pub transaction_id: Uuid,

    pub description: String,

    /// Invoiced amount in whole currency units.
    pub amount: Decimal,

    pub created_at: DateTime<Utc>,
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

    #[sea_orm(
        belongs_to = "super::payment_transaction::Entity",
        from = "Column::TransactionId",
        to = "super::payment_transaction::Column::Id",
        on_update = "Cascade",
        on_delete = "Restrict"
    )]
    PaymentTransaction,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl Related<super::payment_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PaymentTransaction.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn new(order_id: Uuid, transaction_id: Uuid, description: String, amount: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            transaction_id,
            description,
            amount,
            created_at: Utc::now(),
        }
    }
}
