use std::sync::Arc;

use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::{invoice, order, payment_transaction};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Issues one invoice per successful payment transaction.
#[derive(Clone)]
pub struct InvoicingService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl InvoicingService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Creates the invoice for a completed charge. Idempotent on the
    /// transaction id: a replayed callback finds the existing row and
    /// returns it without inserting or re-emitting.
    #[instrument(skip(self, order, transaction), fields(order_id = %order.id, transaction_id = %transaction.id))]
    pub async fn create_for_transaction(
        &self,
        order: &order::Model,
        transaction: &payment_transaction::Model,
    ) -> Result<invoice::Model, ServiceError> {
        let db = &*self.db_pool;

        if let Some(existing) = invoice::Entity::find()
            .filter(invoice::Column::TransactionId.eq(transaction.id))
            .one(db)
            .await
            .map_err(|e| {
                error!(error = %e, transaction_id = %transaction.id, "Failed to look up invoice");
                ServiceError::DatabaseError(e)
            })?
        {
            info!(invoice_id = %existing.id, transaction_id = %transaction.id, "Invoice already issued");
            return Ok(existing);
        }

        let description = format!("Payment for order {}", order.order_number);
        let saved = invoice::Model::new(order.id, transaction.id, description, transaction.amount)
            .into_active_model()
            .insert(db)
            .await
            .map_err(|e| {
                error!(error = %e, transaction_id = %transaction.id, "Failed to create invoice");
                ServiceError::DatabaseError(e)
            })?;

        info!(invoice_id = %saved.id, order_id = %order.id, amount = %saved.amount, "Invoice created");

        if let Some(event_sender) = &self.event_sender {
            if let Err(e) = event_sender
                .send(Event::InvoiceCreated {
                    invoice_id: saved.id,
                    order_id: order.id,
                })
                .await
            {
                warn!(error = %e, invoice_id = %saved.id, "Failed to send invoice created event");
            }
        }

        Ok(saved)
    }

    /// All invoices for an order, oldest first.
    pub async fn find_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<invoice::Model>, ServiceError> {
        let db = &*self.db_pool;
        invoice::Entity::find()
            .filter(invoice::Column::OrderId.eq(order_id))
            .order_by_asc(invoice::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::DatabaseError)
    }
}
