use std::collections::BTreeMap;
use std::sync::Arc;

use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::product;
use crate::errors::{ServiceError, StockShortage};

/// One requested line: a product and how many units of it.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LineRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

/// Guards product availability. Validation is read-only; the only decrement
/// is the guarded conditional update run inside the payment-success
/// transaction, so abandoned payment attempts never hold inventory.
#[derive(Clone)]
pub struct StockService {
    db_pool: Arc<DbPool>,
}

impl StockService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Checks that every requested line can be covered by current
    /// availability. Duplicate product lines are aggregated first; any
    /// shortage rejects the whole request. No side effects either way.
    #[instrument(skip(self, lines), fields(line_count = lines.len()))]
    pub async fn validate(&self, lines: &[LineRequest]) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let wanted = aggregate(lines)?;
        let products = self.load_products(db, &wanted).await?;

        let mut shortages = Vec::new();
        for (product_id, requested) in &wanted {
            let product = products
                .iter()
                .find(|p| p.id == *product_id)
                .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;
            if product.available < *requested {
                shortages.push(StockShortage {
                    product_id: *product_id,
                    requested: *requested,
                    available: product.available,
                });
            }
        }

        if shortages.is_empty() {
            Ok(())
        } else {
            info!(shortage_count = shortages.len(), "Stock validation rejected request");
            Err(ServiceError::InsufficientStock(shortages))
        }
    }

    /// Decrements availability for every line inside the caller's
    /// transaction. Each decrement is guarded (`available >= quantity` in the
    /// WHERE clause); a guard miss means another order took the units since
    /// validation and surfaces as `StockCommitConflict` so the caller can
    /// park the order. Products are processed in id order so two concurrent
    /// commits cannot deadlock on row locks.
    #[instrument(skip(self, conn, lines), fields(line_count = lines.len()))]
    pub async fn commit_for_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        lines: &[LineRequest],
    ) -> Result<(), ServiceError> {
        let wanted = aggregate(lines)?;
        for (product_id, quantity) in &wanted {
            let res = product::Entity::update_many()
                .col_expr(
                    product::Column::Available,
                    Expr::col(product::Column::Available).sub(*quantity),
                )
                .col_expr(
                    product::Column::Version,
                    Expr::col(product::Column::Version).add(1),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
                .filter(product::Column::Id.eq(*product_id))
                .filter(product::Column::Available.gte(*quantity))
                .exec(conn)
                .await
                .map_err(|e| {
                    error!(error = %e, product_id = %product_id, "Stock decrement failed");
                    ServiceError::DatabaseError(e)
                })?;

            if res.rows_affected == 0 {
                let available = product::Entity::find_by_id(*product_id)
                    .one(conn)
                    .await
                    .map_err(ServiceError::DatabaseError)?
                    .map(|p| p.available)
                    .unwrap_or(0);
                warn!(
                    product_id = %product_id,
                    requested = quantity,
                    available = available,
                    "Guarded stock decrement lost the race"
                );
                return Err(ServiceError::StockCommitConflict(vec![StockShortage {
                    product_id: *product_id,
                    requested: *quantity,
                    available,
                }]));
            }
        }
        Ok(())
    }

    /// Restores availability for every line, e.g. when a paid order is
    /// cancelled. Runs inside the caller's transaction.
    #[instrument(skip(self, conn, lines), fields(line_count = lines.len()))]
    pub async fn release_for_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        lines: &[LineRequest],
    ) -> Result<(), ServiceError> {
        let wanted = aggregate(lines)?;
        for (product_id, quantity) in &wanted {
            let res = product::Entity::update_many()
                .col_expr(
                    product::Column::Available,
                    Expr::col(product::Column::Available).add(*quantity),
                )
                .col_expr(
                    product::Column::Version,
                    Expr::col(product::Column::Version).add(1),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
                .filter(product::Column::Id.eq(*product_id))
                .exec(conn)
                .await
                .map_err(|e| {
                    error!(error = %e, product_id = %product_id, "Stock release failed");
                    ServiceError::DatabaseError(e)
                })?;
            if res.rows_affected == 0 {
                return Err(ServiceError::NotFound(format!(
                    "Product {} not found",
                    product_id
                )));
            }
        }
        Ok(())
    }

    async fn load_products<C: ConnectionTrait>(
        &self,
        conn: &C,
        wanted: &BTreeMap<Uuid, i32>,
    ) -> Result<Vec<product::Model>, ServiceError> {
        product::Entity::find()
            .filter(product::Column::Id.is_in(wanted.keys().copied()))
            .all(conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to load products for stock check");
                ServiceError::DatabaseError(e)
            })
    }
}

/// Sums duplicate product lines into one requirement per product, keyed in
/// stable id order.
fn aggregate(lines: &[LineRequest]) -> Result<BTreeMap<Uuid, i32>, ServiceError> {
    let mut wanted: BTreeMap<Uuid, i32> = BTreeMap::new();
    for line in lines {
        if line.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Quantity must be positive for product {}",
                line.product_id
            )));
        }
        *wanted.entry(line.product_id).or_insert(0) += line.quantity;
    }
    if wanted.is_empty() {
        return Err(ServiceError::ValidationError(
            "At least one line is required".to_string(),
        ));
    }
    Ok(wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sums_duplicate_products() {
        let pid = Uuid::new_v4();
        let other = Uuid::new_v4();
        let wanted = aggregate(&[
            LineRequest { product_id: pid, quantity: 2 },
            LineRequest { product_id: other, quantity: 1 },
            LineRequest { product_id: pid, quantity: 3 },
        ])
        .unwrap();
        assert_eq!(wanted.get(&pid), Some(&5));
        assert_eq!(wanted.get(&other), Some(&1));
    }

    #[test]
    fn aggregate_rejects_non_positive_quantity() {
        let err = aggregate(&[LineRequest { product_id: Uuid::new_v4(), quantity: 0 }]).unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }

    #[test]
    fn aggregate_rejects_empty_input() {
        assert!(matches!(
            aggregate(&[]),
            Err(ServiceError::ValidationError(_))
        ));
    }
}
