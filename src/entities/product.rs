use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The `products` table: catalog row plus the single source of truth for
/// on-hand stock. The `available` column is only ever decremented through
/// guarded conditional updates.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    /// Primary key: unique identifier for the product.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Unique stock keeping unit.
    pub sku: String,

    /// Display title of the media item.
    pub title: String,

    /// Kind of media (book, cd, dvd, ...). Free-form, not an enum: the
    /// pipeline never branches on it.
    pub media_type: String,

    /// Current unit price in whole currency units.
    pub unit_price: Decimal,

    /// Shipping weight per unit, in kilograms.
    pub weight_kg: Decimal,

    /// Whether the item qualifies for rush delivery.
    pub rush_eligible: bool,

    /// Units on hand.
    pub available: i32,

    /// Optimistic concurrency counter.
    pub version: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_line::Entity")]
    OrderLines,
}

impl Related<super::order_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderLines.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn new(
        sku: String,
        title: String,
        media_type: String,
        unit_price: Decimal,
        weight_kg: Decimal,
        rush_eligible: bool,
        available: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sku,
            title,
            media_type,
            unit_price,
            weight_kg,
            rush_eligible,
            available,
            version: 1,
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}
