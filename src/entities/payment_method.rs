use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Enum representing the kinds of payment method a shopper can register.
/// The kind decides which gateway adapter handles the charge.
#[derive(
    Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum PaymentMethodType {
    #[sea_orm(string_value = "CreditCard")]
    CreditCard,
    #[sea_orm(string_value = "DomesticDebitCard")]
    DomesticDebitCard,
    #[sea_orm(string_value = "Other")]
    Other,
}

/// The `payment_methods` table. Rows are immutable apart from the default
/// flag.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_methods")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub method_type: PaymentMethodType,

    /// Owning account, if any. Guest checkouts leave this unset.
    pub owner_id: Option<Uuid>,

    /// Label shown to the shopper (e.g. "Visa ending 4242").
    pub display_name: String,

    /// Whether this is the owner's preferred method.
    pub is_default: bool,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn new(method_type: PaymentMethodType, owner_id: Option<Uuid>, display_name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            method_type,
            owner_id,
            display_name,
            is_default: false,
            created_at: Utc::now(),
        }
    }
}
