use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder,
};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::payment_transaction::{self, TransactionStatus, TransactionType};
use crate::errors::ServiceError;
use crate::gateway::{CallbackOutcome, GatewayKind};

/// Append-mostly record of every payment attempt and refund. Rows move from
/// `PendingUserAction` to exactly one terminal status and are never touched
/// again, which is what makes replayed callbacks detectable.
#[derive(Clone)]
pub struct PaymentLedgerService {
    db_pool: Arc<DbPool>,
}

impl PaymentLedgerService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Inserts the pending row for a fresh charge attempt. The id is
    /// caller-supplied because it is also the gateway order reference and
    /// was claimed on the order before the gateway call.
    #[instrument(skip(self, payload), fields(transaction_id = %transaction_id, order_id = %order_id))]
    pub async fn record_charge_attempt(
        &self,
        transaction_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
        amount_minor: i64,
        gateway: GatewayKind,
        external_transaction_id: Option<String>,
        payload: Option<serde_json::Value>,
    ) -> Result<payment_transaction::Model, ServiceError> {
        let db = &*self.db_pool;
        let mut row = payment_transaction::Model::new_charge(
            transaction_id,
            order_id,
            amount,
            amount_minor,
            gateway.as_str().to_string(),
        );
        row.external_transaction_id = external_transaction_id;
        row.gateway_payload = payload;

        let saved = row.into_active_model().insert(db).await.map_err(|e| {
            error!(error = %e, transaction_id = %transaction_id, "Failed to record charge attempt");
            ServiceError::DatabaseError(e)
        })?;
        info!(transaction_id = %saved.id, order_id = %order_id, amount_minor = amount_minor, "Charge attempt recorded");
        Ok(saved)
    }

    /// Inserts a completed refund row referencing the original charge's
    /// gateway transaction. Runs on the caller's connection so it can share
    /// a transaction with the order's `Refunded` edge.
    #[instrument(skip(self, conn, payload), fields(order_id = %order_id))]
    pub async fn record_refund<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        amount: Decimal,
        amount_minor: i64,
        gateway: String,
        external_transaction_id: Option<String>,
        payload: Option<serde_json::Value>,
    ) -> Result<payment_transaction::Model, ServiceError> {
        let mut row = payment_transaction::Model::new_refund(
            order_id,
            amount,
            amount_minor,
            gateway,
            external_transaction_id,
        );
        row.gateway_payload = payload;

        let saved = row.into_active_model().insert(conn).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to record refund");
            ServiceError::DatabaseError(e)
        })?;
        info!(transaction_id = %saved.id, order_id = %order_id, "Refund recorded");
        Ok(saved)
    }

    /// Completes a pending transaction with the verified callback outcome.
    /// The write only lands while the row is still `PendingUserAction`;
    /// `Ok(None)` means the row was already terminal and the caller decides
    /// between replay and staleness.
    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    pub async fn complete(
        &self,
        transaction_id: Uuid,
        outcome: &CallbackOutcome,
        external_transaction_id: Option<String>,
    ) -> Result<Option<payment_transaction::Model>, ServiceError> {
        let db = &*self.db_pool;
        let (status, failure_reason) = terminal_status(outcome);

        let mut update = payment_transaction::Entity::update_many()
            .col_expr(
                payment_transaction::Column::Status,
                Expr::value(status.clone()),
            )
            .col_expr(
                payment_transaction::Column::FailureReason,
                Expr::value(failure_reason),
            )
            .col_expr(
                payment_transaction::Column::CompletedAt,
                Expr::value(Some(Utc::now())),
            );
        if let Some(external_id) = external_transaction_id {
            update = update.col_expr(
                payment_transaction::Column::ExternalTransactionId,
                Expr::value(Some(external_id)),
            );
        }
        let res = update
            .filter(payment_transaction::Column::Id.eq(transaction_id))
            .filter(payment_transaction::Column::Status.eq(TransactionStatus::PendingUserAction))
            .exec(db)
            .await
            .map_err(|e| {
                error!(error = %e, transaction_id = %transaction_id, "Failed to complete transaction");
                ServiceError::DatabaseError(e)
            })?;

        if res.rows_affected == 0 {
            return Ok(None);
        }

        let row = self
            .find_by_id(transaction_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Payment transaction {} not found", transaction_id))
            })?;
        info!(transaction_id = %transaction_id, status = %row.status, "Payment transaction completed");
        Ok(Some(row))
    }

    pub async fn find_by_id(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<payment_transaction::Model>, ServiceError> {
        let db = &*self.db_pool;
        payment_transaction::Entity::find_by_id(transaction_id)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// All ledger rows for an order, oldest first.
    pub async fn find_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<payment_transaction::Model>, ServiceError> {
        let db = &*self.db_pool;
        payment_transaction::Entity::find()
            .filter(payment_transaction::Column::OrderId.eq(order_id))
            .order_by_asc(payment_transaction::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// The order's in-flight transaction, if any. The claim protocol keeps
    /// this to at most one row.
    pub async fn find_non_terminal_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<payment_transaction::Model>, ServiceError> {
        let db = &*self.db_pool;
        payment_transaction::Entity::find()
            .filter(payment_transaction::Column::OrderId.eq(order_id))
            .filter(payment_transaction::Column::Status.eq(TransactionStatus::PendingUserAction))
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// The most recent successful charge, the row a refund is issued
    /// against.
    pub async fn find_successful_charge(
        &self,
        order_id: Uuid,
    ) -> Result<Option<payment_transaction::Model>, ServiceError> {
        let db = &*self.db_pool;
        payment_transaction::Entity::find()
            .filter(payment_transaction::Column::OrderId.eq(order_id))
            .filter(payment_transaction::Column::TransactionType.eq(TransactionType::Charge))
            .filter(payment_transaction::Column::Status.eq(TransactionStatus::Success))
            .order_by_desc(payment_transaction::Column::CreatedAt)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)
    }
}

fn terminal_status(outcome: &CallbackOutcome) -> (TransactionStatus, Option<String>) {
    match outcome {
        CallbackOutcome::Success => (TransactionStatus::Success, None),
        CallbackOutcome::Failed(code) => (TransactionStatus::Failed, Some(code.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_outcome_has_no_failure_reason() {
        let (status, reason) = terminal_status(&CallbackOutcome::Success);
        assert_eq!(status, TransactionStatus::Success);
        assert!(reason.is_none());
    }

    #[test]
    fn failure_outcome_keeps_the_result_code() {
        let (status, reason) = terminal_status(&CallbackOutcome::Failed("51".to_string()));
        assert_eq!(status, TransactionStatus::Failed);
        assert_eq!(reason.as_deref(), Some("51"));
    }
}
