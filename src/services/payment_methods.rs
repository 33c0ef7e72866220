use std::sync::Arc;

use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::payment_method::{self, PaymentMethodType};
use crate::errors::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePaymentMethodRequest {
    pub method_type: PaymentMethodType,
    pub owner_id: Option<Uuid>,
    #[validate(length(min = 1, max = 100, message = "Display name is required"))]
    pub display_name: String,
}

/// Stores the payment methods a shopper can pick at checkout. The method's
/// type decides which gateway adapter handles the charge.
#[derive(Clone)]
pub struct PaymentMethodService {
    db_pool: Arc<DbPool>,
}

impl PaymentMethodService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self, request))]
    pub async fn create(
        &self,
        request: CreatePaymentMethodRequest,
    ) -> Result<payment_method::Model, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        let db = &*self.db_pool;
        let saved = payment_method::Model::new(
            request.method_type,
            request.owner_id,
            request.display_name,
        )
        .into_active_model()
        .insert(db)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create payment method");
            ServiceError::DatabaseError(e)
        })?;

        info!(payment_method_id = %saved.id, method_type = %saved.method_type, "Payment method created");
        Ok(saved)
    }

    #[instrument(skip(self), fields(payment_method_id = %method_id))]
    pub async fn get(&self, method_id: Uuid) -> Result<payment_method::Model, ServiceError> {
        let db = &*self.db_pool;
        payment_method::Entity::find_by_id(method_id)
            .one(db)
            .await
            .map_err(ServiceError::DatabaseError)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Payment method {} not found", method_id))
            })
    }

    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn list_for_owner(
        &self,
        owner_id: Uuid,
    ) -> Result<Vec<payment_method::Model>, ServiceError> {
        let db = &*self.db_pool;
        payment_method::Entity::find()
            .filter(payment_method::Column::OwnerId.eq(owner_id))
            .order_by_asc(payment_method::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)
    }

    /// Makes one method the owner's default, clearing the previous default
    /// in the same transaction.
    #[instrument(skip(self), fields(owner_id = %owner_id, payment_method_id = %method_id))]
    pub async fn set_default(
        &self,
        owner_id: Uuid,
        method_id: Uuid,
    ) -> Result<payment_method::Model, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for default payment method");
            ServiceError::DatabaseError(e)
        })?;

        payment_method::Entity::update_many()
            .col_expr(payment_method::Column::IsDefault, Expr::value(false))
            .filter(payment_method::Column::OwnerId.eq(owner_id))
            .filter(payment_method::Column::IsDefault.eq(true))
            .exec(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, owner_id = %owner_id, "Failed to clear previous default");
                ServiceError::DatabaseError(e)
            })?;

        let res = payment_method::Entity::update_many()
            .col_expr(payment_method::Column::IsDefault, Expr::value(true))
            .filter(payment_method::Column::Id.eq(method_id))
            .filter(payment_method::Column::OwnerId.eq(owner_id))
            .exec(&txn)
            .await
            .map_err(|e| {
                error!(error = %e, payment_method_id = %method_id, "Failed to set default");
                ServiceError::DatabaseError(e)
            })?;

        if res.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Payment method {} not found for owner {}",
                method_id, owner_id
            )));
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit default payment method change");
            ServiceError::DatabaseError(e)
        })?;

        info!(payment_method_id = %method_id, owner_id = %owner_id, "Default payment method updated");
        self.get(method_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_is_required() {
        let request = CreatePaymentMethodRequest {
            method_type: PaymentMethodType::DomesticDebitCard,
            owner_id: None,
            display_name: String::new(),
        };
        assert!(request.validate().is_err());
    }
}
