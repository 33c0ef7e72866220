use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::db::DbPool;
use crate::entities::order::{self, OrderStatus};
use crate::entities::{delivery_info, order_line};
use crate::errors::ServiceError;
use crate::services::fees::{OrderQuote, PricedLine};

/// Recipient details collected before an order can be paid.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DeliveryDetails {
    #[validate(length(min = 1, message = "Recipient name is required"))]
    pub recipient_name: String,
    #[validate(custom = "validate_phone")]
    pub phone: String,
    #[validate(email(message = "Email address is not valid"))]
    pub email: String,
    #[validate(length(min = 1, message = "Delivery address is required"))]
    pub address: String,
    #[validate(length(min = 1, message = "Province is required"))]
    pub province: String,
    #[validate(length(max = 500, message = "Courier message is too long"))]
    pub message: Option<String>,
}

fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    let len_ok = (8..=15).contains(&phone.len());
    if !len_ok || !phone.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::new("phone_digits"));
    }
    Ok(())
}

/// Owns order and order-line rows: creation, reads and every status write.
/// Status changes go through compare-and-swap updates keyed on the expected
/// status plus a version bump, so a lost race is surfaced instead of
/// silently overwritten. No other code path mutates `orders.status`.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
}

impl OrderService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Persists delivery details, the order and its lines in a single
    /// transaction, then moves the order into `PendingPayment` through the
    /// central transition so creation exercises the lifecycle table too.
    #[instrument(skip(self, delivery, lines, quote), fields(line_count = lines.len()))]
    pub async fn create_order(
        &self,
        delivery: &DeliveryDetails,
        lines: &[PricedLine],
        quote: &OrderQuote,
        rush_order: bool,
    ) -> Result<order::Model, ServiceError> {
        delivery
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        if lines.is_empty() {
            return Err(ServiceError::ValidationError(
                "At least one line is required".to_string(),
            ));
        }

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order creation");
            ServiceError::DatabaseError(e)
        })?;

        let delivery_row = delivery_info::ActiveModel {
            id: Set(Uuid::new_v4()),
            recipient_name: Set(delivery.recipient_name.clone()),
            phone: Set(delivery.phone.clone()),
            email: Set(delivery.email.clone()),
            address: Set(delivery.address.clone()),
            province: Set(delivery.province.clone()),
            message: Set(delivery.message.clone()),
            shipping_fee: Set(quote.shipping_fee),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to persist delivery info");
            ServiceError::DatabaseError(e)
        })?;

        let order = order::Model::new(
            delivery_row.id,
            quote.subtotal,
            quote.vat,
            quote.shipping_fee,
            quote.total,
            rush_order,
        )
        .into_active_model()
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to persist order");
            ServiceError::DatabaseError(e)
        })?;

        for line in lines {
            order_line::Model::new(order.id, line.product_id, line.quantity, line.unit_price)
                .into_active_model()
                .insert(&txn)
                .await
                .map_err(|e| {
                    error!(error = %e, order_id = %order.id, product_id = %line.product_id, "Failed to persist order line");
                    ServiceError::DatabaseError(e)
                })?;
        }

        let order = self
            .transition_status_on(
                &txn,
                order.id,
                OrderStatus::PendingDeliveryInfo,
                OrderStatus::PendingPayment,
            )
            .await?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order.id, "Failed to commit order creation");
            ServiceError::DatabaseError(e)
        })?;

        info!(order_id = %order.id, order_number = %order.order_number, total = %order.total, "Order created");
        Ok(order)
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;
        order::Entity::find_by_id(order_id)
            .one(db)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to fetch order");
                ServiceError::DatabaseError(e)
            })?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order_with_lines(
        &self,
        order_id: Uuid,
    ) -> Result<(order::Model, Vec<order_line::Model>), ServiceError> {
        let db = &*self.db_pool;
        let mut found = order::Entity::find_by_id(order_id)
            .find_with_related(order_line::Entity)
            .all(db)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to fetch order with lines");
                ServiceError::DatabaseError(e)
            })?;
        match found.pop() {
            Some(pair) => Ok(pair),
            None => Err(ServiceError::NotFound(format!(
                "Order {} not found",
                order_id
            ))),
        }
    }

    /// Moves an order along one edge of the lifecycle. The write only lands
    /// when the row still carries `expected`; zero rows affected is re-read
    /// and classified as `NotFound`, `IllegalTransition` or
    /// `ConcurrentModification`.
    #[instrument(skip(self), fields(order_id = %order_id, from = %expected, to = %next))]
    pub async fn transition_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;
        self.transition_status_on(db, order_id, expected, next).await
    }

    /// Same as `transition_status` but on a caller-provided connection, so
    /// the edge can be combined with other writes in one transaction.
    pub async fn transition_status_on<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        if !expected.can_transition_to(&next) {
            return Err(ServiceError::IllegalTransition {
                from: expected,
                to: next,
            });
        }

        let res = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(next.clone()))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(expected.clone()))
            .exec(conn)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Status transition write failed");
                ServiceError::DatabaseError(e)
            })?;

        if res.rows_affected == 0 {
            return Err(self.classify_lost_write(conn, order_id, &next).await?);
        }

        let order = self.reload(conn, order_id).await?;
        info!(order_id = %order_id, status = %order.status, "Order status updated");
        Ok(order)
    }

    /// Records the captured amount while taking the paid edge
    /// `PendingPayment -> PendingProcessing`. The two writes are one CAS so
    /// `total_paid` can never appear on an unpaid order.
    #[instrument(skip(self), fields(order_id = %order_id, amount = %amount))]
    pub async fn set_total_paid(
        &self,
        order_id: Uuid,
        amount: Decimal,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;
        let res = order::Entity::update_many()
            .col_expr(
                order::Column::Status,
                Expr::value(OrderStatus::PendingProcessing),
            )
            .col_expr(order::Column::TotalPaid, Expr::value(Some(amount)))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::PendingPayment))
            .exec(db)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Paid transition write failed");
                ServiceError::DatabaseError(e)
            })?;

        if res.rows_affected == 0 {
            return Err(self
                .classify_lost_write(db, order_id, &OrderStatus::PendingProcessing)
                .await?);
        }

        let order = self.reload(db, order_id).await?;
        info!(order_id = %order_id, total_paid = %amount, "Order marked as paid");
        Ok(order)
    }

    /// Claims the order's in-flight transaction slot for a new payment
    /// attempt. The write only lands while the slot is empty; a claimed slot
    /// surfaces as `PaymentAlreadyInProgress`.
    #[instrument(skip(self), fields(order_id = %order_id, transaction_id = %transaction_id))]
    pub async fn claim_active_transaction(
        &self,
        order_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let res = order::Entity::update_many()
            .col_expr(
                order::Column::ActiveTransactionId,
                Expr::value(Some(transaction_id)),
            )
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::ActiveTransactionId.is_null())
            .exec(db)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Transaction claim write failed");
                ServiceError::DatabaseError(e)
            })?;

        if res.rows_affected == 0 {
            let order = self.reload(db, order_id).await?;
            if order.active_transaction_id.is_some() {
                return Err(ServiceError::PaymentAlreadyInProgress(order_id));
            }
            return Err(ServiceError::ConcurrentModification(order_id));
        }
        Ok(())
    }

    /// Releases the in-flight transaction slot. Clearing an already empty or
    /// re-claimed slot is a no-op; replayed callbacks land here.
    #[instrument(skip(self), fields(order_id = %order_id, transaction_id = %transaction_id))]
    pub async fn clear_active_transaction(
        &self,
        order_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let res = order::Entity::update_many()
            .col_expr(
                order::Column::ActiveTransactionId,
                Expr::value(Option::<Uuid>::None),
            )
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::ActiveTransactionId.eq(transaction_id))
            .exec(db)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Transaction release write failed");
                ServiceError::DatabaseError(e)
            })?;
        if res.rows_affected == 0 {
            debug!(order_id = %order_id, transaction_id = %transaction_id, "Transaction slot already released");
        }
        Ok(())
    }

    async fn classify_lost_write<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        next: &OrderStatus,
    ) -> Result<ServiceError, ServiceError> {
        let current = order::Entity::find_by_id(order_id)
            .one(conn)
            .await
            .map_err(ServiceError::DatabaseError)?;
        Ok(match current {
            None => ServiceError::NotFound(format!("Order {} not found", order_id)),
            Some(order) if !order.status.can_transition_to(next) => {
                ServiceError::IllegalTransition {
                    from: order.status,
                    to: next.clone(),
                }
            }
            Some(order) => ServiceError::ConcurrentModification(order.id),
        })
    }

    async fn reload<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(conn)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery() -> DeliveryDetails {
        DeliveryDetails {
            recipient_name: "Nguyen Van A".to_string(),
            phone: "0901234567".to_string(),
            email: "a@example.com".to_string(),
            address: "1 Tran Hung Dao".to_string(),
            province: "Hanoi".to_string(),
            message: None,
        }
    }

    #[test]
    fn delivery_details_validate() {
        assert!(delivery().validate().is_ok());
    }

    #[test]
    fn phone_must_be_digits() {
        let mut d = delivery();
        d.phone = "09-123-4567".to_string();
        assert!(d.validate().is_err());
    }

    #[test]
    fn phone_length_is_bounded() {
        let mut d = delivery();
        d.phone = "09".to_string();
        assert!(d.validate().is_err());
        d.phone = "0".repeat(16);
        assert!(d.validate().is_err());
    }

    #[test]
    fn email_is_checked() {
        let mut d = delivery();
        d.email = "not-an-email".to_string();
        assert!(d.validate().is_err());
    }
}
