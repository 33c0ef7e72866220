use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The `delivery_info` table. Rows are written once during order creation,
/// after the recipient details have passed validation.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "delivery_info")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Name of the person receiving the delivery.
    pub recipient_name: String,

    /// Contact phone, digits only.
    pub phone: String,

    /// Contact email.
    pub email: String,

    /// Street address.
    pub address: String,

    /// Province or city used for shipping fee calculation.
    pub province: String,

    /// Optional note from the shopper to the courier.
    pub message: Option<String>,

    /// Shipping fee computed when the order was quoted.
    pub shipping_fee: Decimal,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order::Entity")]
    Orders,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Orders.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
