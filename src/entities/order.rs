use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Enum representing the possible statuses of an order.
#[derive(
    Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum OrderStatus {
    /// Order row exists but delivery details are not confirmed yet.
    #[sea_orm(string_value = "PendingDeliveryInfo")]
    PendingDeliveryInfo,
    /// Awaiting a payment attempt or its gateway callback.
    #[sea_orm(string_value = "PendingPayment")]
    PendingPayment,
    /// Last payment attempt failed; the shopper may retry.
    #[sea_orm(string_value = "PaymentFailed")]
    PaymentFailed,
    /// Paid, stock committed, waiting for operator review.
    #[sea_orm(string_value = "PendingProcessing")]
    PendingProcessing,
    #[sea_orm(string_value = "Approved")]
    Approved,
    #[sea_orm(string_value = "Rejected")]
    Rejected,
    #[sea_orm(string_value = "Shipping")]
    Shipping,
    #[sea_orm(string_value = "Delivered")]
    Delivered,
    #[sea_orm(string_value = "Cancelled")]
    Cancelled,
    #[sea_orm(string_value = "Refunded")]
    Refunded,
    /// Payment succeeded but the stock decrement lost its race. Parked for
    /// manual reconciliation; never resolves to Approved on its own.
    #[sea_orm(string_value = "ErrorStockUpdateFailed")]
    ErrorStockUpdateFailed,
}

impl OrderStatus {
    /// Whether the edge `self -> next` exists in the lifecycle.
    ///
    /// Same-state writes are not edges and return false.
    pub fn can_transition_to(&self, next: &OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            // From pending delivery info
            (PendingDeliveryInfo, PendingPayment) => true,

            // From pending payment
            (PendingPayment, PaymentFailed) => true,
            (PendingPayment, PendingProcessing) => true,

            // A failed payment may only re-enter the payment flow
            (PaymentFailed, PendingPayment) => true,

            // From pending processing
            (PendingProcessing, Approved) => true,
            (PendingProcessing, Rejected) => true,
            (PendingProcessing, ErrorStockUpdateFailed) => true,

            // From approved
            (Approved, Shipping) => true,
            (Approved, Cancelled) => true,
            (Approved, Refunded) => true,

            // From shipping
            (Shipping, Delivered) => true,
            (Shipping, Cancelled) => true,
            (Shipping, Refunded) => true,

            // Post-delivery / post-cancellation refunds
            (Delivered, Refunded) => true,
            (Cancelled, Refunded) => true,

            _ => false,
        }
    }

    /// Statuses with no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Rejected | OrderStatus::Refunded | OrderStatus::ErrorStockUpdateFailed
        )
    }

    /// Statuses reached only after a successful charge.
    pub fn is_paid(&self) -> bool {
        !matches!(
            self,
            OrderStatus::PendingDeliveryInfo
                | OrderStatus::PendingPayment
                | OrderStatus::PaymentFailed
        )
    }
}

/// The `orders` table.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    /// Primary key: unique identifier for the order.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Unique human-facing order number.
    pub order_number: String,

    /// Current lifecycle status.
    pub status: OrderStatus,

    /// Foreign key referencing the confirmed delivery details.
    pub delivery_info_id: Uuid,

    /// Sum of line totals in whole currency units.
    pub subtotal: Decimal,

    /// VAT charged on the subtotal.
    pub vat_amount: Decimal,

    /// Shipping fee, including any rush surcharge.
    pub shipping_fee: Decimal,

    /// Grand total the shopper is asked to pay.
    pub total: Decimal,

    /// Amount actually captured. Set only when a paid status is reached.
    pub total_paid: Option<Decimal>,

    /// Whether rush delivery was requested.
    pub rush_order: bool,

    /// Pointer to the order's single in-flight payment transaction.
    /// Claimed and cleared only through conditional writes.
    pub active_transaction_id: Option<Uuid>,

    /// Optimistic concurrency counter.
    pub version: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_line::Entity")]
    OrderLines,

    #[sea_orm(
        belongs_to = "super::delivery_info::Entity",
        from = "Column::DeliveryInfoId",
        to = "super::delivery_info::Column::Id",
        on_update = "Cascade",
        on_delete = "Restrict"
    )]
    DeliveryInfo,

    #[sea_orm(has_many = "super::payment_transaction::Entity")]
    PaymentTransactions,

    #[sea_orm(has_many = "super::invoice::Entity")]
    Invoices,
}

impl Related<super::order_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderLines.def()
    }
}

impl Related<super::delivery_info::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DeliveryInfo.def()
    }
}

impl Related<super::payment_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PaymentTransactions.def()
    }
}

impl Related<super::invoice::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Invoices.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Creates a new order in the initial status with its quoted amounts.
    pub fn new(
        delivery_info_id: Uuid,
        subtotal: Decimal,
        vat_amount: Decimal,
        shipping_fee: Decimal,
        total: Decimal,
        rush_order: bool,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            order_number: Self::order_number_for(id),
            status: OrderStatus::PendingDeliveryInfo,
            delivery_info_id,
            subtotal,
            vat_amount,
            shipping_fee,
            total,
            total_paid: None,
            rush_order,
            active_transaction_id: None,
            version: 1,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Derives the human-facing order number from the order id.
    pub fn order_number_for(id: Uuid) -> String {
        let short = id.simple().to_string();
        format!("ORD-{}", &short[..12].to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Iterable;

    fn all_statuses() -> Vec<OrderStatus> {
        OrderStatus::iter().collect()
    }

    #[test]
    fn legal_edges_are_allowed() {
        use OrderStatus::*;
        let legal = [
            (PendingDeliveryInfo, PendingPayment),
            (PendingPayment, PaymentFailed),
            (PendingPayment, PendingProcessing),
            (PaymentFailed, PendingPayment),
            (PendingProcessing, Approved),
            (PendingProcessing, Rejected),
            (PendingProcessing, ErrorStockUpdateFailed),
            (Approved, Shipping),
            (Approved, Cancelled),
            (Approved, Refunded),
            (Shipping, Delivered),
            (Shipping, Cancelled),
            (Shipping, Refunded),
            (Delivered, Refunded),
            (Cancelled, Refunded),
        ];
        for (from, to) in legal {
            assert!(
                from.can_transition_to(&to),
                "{} -> {} should be allowed",
                from,
                to
            );
        }
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        for from in all_statuses() {
            if !from.is_terminal() {
                continue;
            }
            for to in all_statuses() {
                assert!(
                    !from.can_transition_to(&to),
                    "terminal {} must not reach {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn same_state_is_not_an_edge() {
        for status in all_statuses() {
            assert!(!status.can_transition_to(&status.clone()));
        }
    }

    #[test]
    fn skipping_payment_is_rejected() {
        use OrderStatus::*;
        // No paid status is reachable directly from the unpaid ones.
        for from in [PendingDeliveryInfo, PaymentFailed] {
            for to in [Approved, Shipping, Delivered, Cancelled, Refunded] {
                assert!(!from.can_transition_to(&to), "{} -> {} leaked", from, to);
            }
        }
        assert!(!PendingPayment.can_transition_to(&Approved));
        assert!(!PendingPayment.can_transition_to(&Cancelled));
        assert!(!PendingPayment.can_transition_to(&Refunded));
    }

    #[test]
    fn stock_failure_parking_never_resolves() {
        use OrderStatus::*;
        assert!(PendingProcessing.can_transition_to(&ErrorStockUpdateFailed));
        assert!(!ErrorStockUpdateFailed.can_transition_to(&Approved));
        assert!(!ErrorStockUpdateFailed.can_transition_to(&PendingProcessing));
    }

    #[test]
    fn paid_statuses_classified() {
        use OrderStatus::*;
        for unpaid in [PendingDeliveryInfo, PendingPayment, PaymentFailed] {
            assert!(!unpaid.is_paid());
        }
        for paid in [
            PendingProcessing,
            Approved,
            Rejected,
            Shipping,
            Delivered,
            Cancelled,
            Refunded,
            ErrorStockUpdateFailed,
        ] {
            assert!(paid.is_paid());
        }
    }

    #[test]
    fn order_number_is_prefixed_and_stable() {
        let id = Uuid::new_v4();
        let number = Model::order_number_for(id);
        assert!(number.starts_with("ORD-"));
        assert_eq!(number.len(), "ORD-".len() + 12);
        assert_eq!(number, Model::order_number_for(id));
    }
}
