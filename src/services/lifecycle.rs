use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::IntCounter;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, TransactionTrait};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::order::{self, OrderStatus};
use crate::entities::payment_transaction::{self, TransactionStatus};
use crate::entities::product;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateway::{
    to_minor_units, CallbackOutcome, GatewayKind, GatewayRegistry, InitiateRequest,
    VerifiedCallback,
};
use crate::services::fees::{FeeCalculator, PricedLine};
use crate::services::invoicing::InvoicingService;
use crate::services::ledger::PaymentLedgerService;
use crate::services::orders::{DeliveryDetails, OrderService};
use crate::services::payment_methods::PaymentMethodService;
use crate::services::stock::{LineRequest, StockService};

lazy_static! {
    static ref ORDERS_PLACED: IntCounter =
        IntCounter::new("orders_placed_total", "Total number of orders placed")
            .expect("metric can be created");
    static ref ORDER_PLACEMENT_FAILURES: IntCounter = IntCounter::new(
        "order_placement_failures_total",
        "Total number of rejected order placements"
    )
    .expect("metric can be created");
    static ref PAYMENTS_INITIATED: IntCounter = IntCounter::new(
        "payments_initiated_total",
        "Total number of payment attempts handed to a gateway"
    )
    .expect("metric can be created");
    static ref PAYMENT_INITIATION_FAILURES: IntCounter = IntCounter::new(
        "payment_initiation_failures_total",
        "Total number of payment attempts that never reached the gateway"
    )
    .expect("metric can be created");
    static ref CALLBACKS_RECONCILED: IntCounter = IntCounter::new(
        "payment_callbacks_reconciled_total",
        "Total number of gateway callbacks applied to the ledger"
    )
    .expect("metric can be created");
    static ref CALLBACK_REJECTIONS: IntCounter = IntCounter::new(
        "payment_callback_rejections_total",
        "Total number of gateway callbacks rejected before any state change"
    )
    .expect("metric can be created");
    static ref ORDERS_PARKED: IntCounter = IntCounter::new(
        "orders_parked_total",
        "Total number of paid orders parked after a stock commit conflict"
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PlaceOrderRequest {
    #[validate(length(min = 1, message = "At least one line is required"))]
    pub lines: Vec<LineRequest>,
    #[validate]
    pub delivery: DeliveryDetails,
    pub rush_order: bool,
}

/// What the shopper needs to continue a payment attempt.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentInitiation {
    pub transaction_id: Uuid,
    pub gateway: GatewayKind,
    /// Hosted payment page (redirect flow) or extra verification page
    /// (card flow), when one is required.
    pub redirect_url: Option<String>,
}

/// Order and ledger state after a callback has been applied or replayed.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub order: order::Model,
    pub transaction: payment_transaction::Model,
}

/// Order state and ledger row produced by a refund.
#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub order: order::Model,
    pub refund: payment_transaction::Model,
}

/// Drives orders through their lifecycle: placement, payment initiation,
/// callback reconciliation and the operator transitions. All status writes
/// go through `OrderService`; this engine sequences them and owns the
/// policy decisions, like committing stock only at payment success.
#[derive(Clone)]
pub struct OrderLifecycleEngine {
    db_pool: Arc<DbPool>,
    orders: OrderService,
    stock: StockService,
    ledger: PaymentLedgerService,
    invoicing: InvoicingService,
    payment_methods: PaymentMethodService,
    gateways: Arc<GatewayRegistry>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderLifecycleEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_pool: Arc<DbPool>,
        orders: OrderService,
        stock: StockService,
        ledger: PaymentLedgerService,
        invoicing: InvoicingService,
        payment_methods: PaymentMethodService,
        gateways: Arc<GatewayRegistry>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            orders,
            stock,
            ledger,
            invoicing,
            payment_methods,
            gateways,
            event_sender,
        }
    }

    /// Builds the engine with default service wiring over one pool.
    pub fn from_pool(
        db_pool: Arc<DbPool>,
        gateways: Arc<GatewayRegistry>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            orders: OrderService::new(db_pool.clone()),
            stock: StockService::new(db_pool.clone()),
            ledger: PaymentLedgerService::new(db_pool.clone()),
            invoicing: InvoicingService::new(db_pool.clone(), event_sender.clone()),
            payment_methods: PaymentMethodService::new(db_pool.clone()),
            gateways,
            event_sender,
            db_pool,
        }
    }

    pub fn orders(&self) -> &OrderService {
        &self.orders
    }

    pub fn ledger(&self) -> &PaymentLedgerService {
        &self.ledger
    }

    pub fn invoicing(&self) -> &InvoicingService {
        &self.invoicing
    }

    pub fn payment_methods(&self) -> &PaymentMethodService {
        &self.payment_methods
    }

    /// Validates the request, checks stock and quotes fees, then persists
    /// the order in `PendingPayment`. Stock is not decremented here; the
    /// commit point is payment success.
    #[instrument(skip(self, request), fields(line_count = request.lines.len(), rush = request.rush_order))]
    pub async fn place_order(
        &self,
        request: PlaceOrderRequest,
    ) -> Result<order::Model, ServiceError> {
        request.validate().map_err(|e| {
            ORDER_PLACEMENT_FAILURES.inc();
            let msg = format!("Invalid order request: {}", e);
            warn!("{}", msg);
            ServiceError::ValidationError(msg)
        })?;

        let products = self.load_products(&request.lines).await?;

        for line in &request.lines {
            if line.quantity <= 0 {
                ORDER_PLACEMENT_FAILURES.inc();
                return Err(ServiceError::ValidationError(format!(
                    "Quantity must be positive for product {}",
                    line.product_id
                )));
            }
        }

        if request.rush_order {
            let mut ineligible: Vec<Uuid> = products
                .iter()
                .filter(|p| !p.rush_eligible)
                .map(|p| p.id)
                .collect();
            if !ineligible.is_empty() {
                ineligible.sort();
                ORDER_PLACEMENT_FAILURES.inc();
                info!(ineligible_count = ineligible.len(), "Rush order rejected");
                return Err(ServiceError::RushIneligible(ineligible));
            }
        }

        self.stock.validate(&request.lines).await.map_err(|e| {
            ORDER_PLACEMENT_FAILURES.inc();
            e
        })?;

        let mut priced = Vec::with_capacity(request.lines.len());
        for line in &request.lines {
            let product = products
                .iter()
                .find(|p| p.id == line.product_id)
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", line.product_id))
                })?;
            priced.push(PricedLine {
                product_id: product.id,
                quantity: line.quantity,
                unit_price: product.unit_price,
                weight_kg: product.weight_kg,
                rush_eligible: product.rush_eligible,
            });
        }

        let quote = FeeCalculator::compute(&priced, &request.delivery, request.rush_order)?;
        let order = self
            .orders
            .create_order(&request.delivery, &priced, &quote, request.rush_order)
            .await?;

        self.emit(Event::OrderPlaced(order.id)).await;
        ORDERS_PLACED.inc();
        info!(order_id = %order.id, order_number = %order.order_number, total = %order.total, "Order placed");
        Ok(order)
    }

    /// Starts a payment attempt: claims the order's transaction slot, asks
    /// the gateway for a redirect and records the pending ledger row. On a
    /// gateway error the claim is released and the order stays
    /// `PendingPayment`.
    #[instrument(skip(self), fields(order_id = %order_id, payment_method_id = %payment_method_id))]
    pub async fn initiate_payment(
        &self,
        order_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<PaymentInitiation, ServiceError> {
        let order = self.orders.get_order(order_id).await?;
        let order = match order.status {
            OrderStatus::PendingPayment => order,
            // A failed attempt re-enters the payment flow through the table.
            OrderStatus::PaymentFailed => {
                self.orders
                    .transition_status(
                        order_id,
                        OrderStatus::PaymentFailed,
                        OrderStatus::PendingPayment,
                    )
                    .await?
            }
            ref status => {
                PAYMENT_INITIATION_FAILURES.inc();
                return Err(ServiceError::InvalidOperation(format!(
                    "Payment cannot be initiated for order {} in status {}",
                    order_id, status
                )));
            }
        };

        let method = self.payment_methods.get(payment_method_id).await?;
        let adapter = self.gateways.for_method_type(&method.method_type)?;

        let amount_minor = to_minor_units(order.total, self.gateways.minor_unit_factor())
            .ok_or_else(|| {
                ServiceError::InvalidOperation(format!(
                    "Order total {} cannot be expressed in minor units",
                    order.total
                ))
            })?;

        let transaction_id = Uuid::new_v4();
        self.orders
            .claim_active_transaction(order_id, transaction_id)
            .await
            .map_err(|e| {
                PAYMENT_INITIATION_FAILURES.inc();
                e
            })?;

        let order_info = format!("Payment for order {}", order.order_number);
        let initiate_request = InitiateRequest {
            order_ref: transaction_id.to_string(),
            order_info: order_info.clone(),
            amount_minor,
        };

        let initiated = match adapter.initiate(&initiate_request).await {
            Ok(initiated) => initiated,
            Err(gateway_error) => {
                PAYMENT_INITIATION_FAILURES.inc();
                warn!(error = %gateway_error, order_id = %order_id, "Gateway initiation failed, releasing claim");
                self.release_claim(order_id, transaction_id).await;
                return Err(gateway_error.into());
            }
        };

        let payload = serde_json::json!({
            "redirect_url": initiated.redirect_url,
            "order_info": order_info,
        });
        let transaction = match self
            .ledger
            .record_charge_attempt(
                transaction_id,
                order_id,
                order.total,
                amount_minor,
                adapter.kind(),
                initiated.external_transaction_id.clone(),
                Some(payload),
            )
            .await
        {
            Ok(transaction) => transaction,
            Err(e) => {
                // Without a pending row there is nothing for a callback to
                // complete, so the claim has to go too.
                self.release_claim(order_id, transaction_id).await;
                return Err(e);
            }
        };

        self.emit(Event::PaymentInitiated {
            order_id,
            transaction_id: transaction.id,
        })
        .await;
        PAYMENTS_INITIATED.inc();
        info!(order_id = %order_id, transaction_id = %transaction.id, gateway = %adapter.kind(), "Payment initiated");

        Ok(PaymentInitiation {
            transaction_id: transaction.id,
            gateway: adapter.kind(),
            redirect_url: initiated.redirect_url,
        })
    }

    /// Applies one gateway callback. Verification comes first and rejects
    /// forged or malformed callbacks before any state is read; replays of an
    /// already-settled attempt return the recorded state untouched.
    #[instrument(skip(self, params), fields(gateway = %gateway_kind))]
    pub async fn reconcile(
        &self,
        gateway_kind: GatewayKind,
        params: &HashMap<String, String>,
    ) -> Result<Reconciliation, ServiceError> {
        let adapter = self.gateways.by_kind(gateway_kind)?;
        let verified = adapter.verify_callback(params).map_err(|e| {
            CALLBACK_REJECTIONS.inc();
            warn!(error = %e, gateway = %gateway_kind, "Callback rejected during verification");
            ServiceError::from(e)
        })?;

        let transaction_id = Uuid::parse_str(&verified.order_ref).map_err(|_| {
            CALLBACK_REJECTIONS.inc();
            warn!(order_ref = %verified.order_ref, "Callback order reference is not a transaction id");
            ServiceError::UnknownOrStaleTransaction(verified.order_ref.clone())
        })?;

        let transaction = self
            .ledger
            .find_by_id(transaction_id)
            .await?
            .ok_or_else(|| {
                CALLBACK_REJECTIONS.inc();
                warn!(transaction_id = %transaction_id, "Callback references an unknown transaction");
                ServiceError::UnknownOrStaleTransaction(verified.order_ref.clone())
            })?;

        let order = self.orders.get_order(transaction.order_id).await?;

        if transaction.status.is_terminal() {
            if is_identical_replay(&transaction, &verified) {
                info!(transaction_id = %transaction_id, "Replayed callback, returning recorded state");
                return Ok(Reconciliation { order, transaction });
            }
            CALLBACK_REJECTIONS.inc();
            warn!(transaction_id = %transaction_id, status = %transaction.status, "Conflicting callback for a settled transaction");
            return Err(ServiceError::UnknownOrStaleTransaction(
                verified.order_ref.clone(),
            ));
        }

        if order.active_transaction_id != Some(transaction_id) {
            CALLBACK_REJECTIONS.inc();
            warn!(transaction_id = %transaction_id, order_id = %order.id, "Callback transaction is not the order's active attempt");
            return Err(ServiceError::UnknownOrStaleTransaction(
                verified.order_ref.clone(),
            ));
        }

        if verified.amount_minor != transaction.amount_minor {
            CALLBACK_REJECTIONS.inc();
            warn!(
                transaction_id = %transaction_id,
                expected_minor = transaction.amount_minor,
                received_minor = verified.amount_minor,
                "Callback amount does not match the recorded charge"
            );
            return Err(ServiceError::AmountMismatch {
                expected_minor: transaction.amount_minor,
                received_minor: verified.amount_minor,
            });
        }

        match verified.outcome.clone() {
            CallbackOutcome::Success => {
                self.apply_payment_success(order, transaction, &verified).await
            }
            CallbackOutcome::Failed(code) => {
                self.apply_payment_failure(order, transaction, &verified, code)
                    .await
            }
        }
    }

    /// Cancels an order through the lifecycle table and restores its
    /// committed stock in the same transaction. Rejected while a payment
    /// attempt is still in flight.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        let order = self.orders.get_order(order_id).await?;
        if let Some(pending) = self.ledger.find_non_terminal_for_order(order_id).await? {
            warn!(order_id = %order_id, transaction_id = %pending.id, "Cancellation rejected while a payment attempt is in flight");
            return Err(ServiceError::PaymentAlreadyInProgress(order_id));
        }

        let lines = self.order_lines_as_requests(order_id).await?;

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start cancellation transaction");
            ServiceError::DatabaseError(e)
        })?;
        let cancelled = self
            .orders
            .transition_status_on(&txn, order_id, order.status.clone(), OrderStatus::Cancelled)
            .await?;
        self.stock.release_for_order(&txn, &lines).await?;
        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit cancellation");
            ServiceError::DatabaseError(e)
        })?;

        self.emit(Event::OrderCancelled(order_id)).await;
        info!(order_id = %order_id, "Order cancelled");
        Ok(cancelled)
    }

    /// Operator accepts a paid order for fulfilment.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn approve_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        self.operator_transition(order_id, OrderStatus::PendingProcessing, OrderStatus::Approved)
            .await
    }

    /// Operator declines a paid order.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn reject_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        self.operator_transition(order_id, OrderStatus::PendingProcessing, OrderStatus::Rejected)
            .await
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn mark_shipped(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        self.operator_transition(order_id, OrderStatus::Approved, OrderStatus::Shipping)
            .await
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn mark_delivered(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        self.operator_transition(order_id, OrderStatus::Shipping, OrderStatus::Delivered)
            .await
    }

    /// Refunds an order's successful charge. The `Refunded` edge and the
    /// refund ledger row land in one transaction; the ledger row is the
    /// system of record, no gateway call is made.
    #[instrument(skip(self, reason), fields(order_id = %order_id))]
    pub async fn refund_order(
        &self,
        order_id: Uuid,
        reason: Option<String>,
    ) -> Result<RefundOutcome, ServiceError> {
        let order = self.orders.get_order(order_id).await?;
        if let Some(pending) = self.ledger.find_non_terminal_for_order(order_id).await? {
            warn!(order_id = %order_id, transaction_id = %pending.id, "Refund rejected while a payment attempt is in flight");
            return Err(ServiceError::PaymentAlreadyInProgress(order_id));
        }
        let charge = self
            .ledger
            .find_successful_charge(order_id)
            .await?
            .ok_or_else(|| {
                ServiceError::InvalidOperation(format!(
                    "Order {} has no successful charge to refund",
                    order_id
                ))
            })?;

        let payload = reason.map(|r| serde_json::json!({ "reason": r }));

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start refund transaction");
            ServiceError::DatabaseError(e)
        })?;
        let refunded = self
            .orders
            .transition_status_on(&txn, order_id, order.status.clone(), OrderStatus::Refunded)
            .await?;
        let refund = self
            .ledger
            .record_refund(
                &txn,
                order_id,
                charge.amount,
                charge.amount_minor,
                charge.gateway.clone(),
                charge.external_transaction_id.clone(),
                payload,
            )
            .await?;
        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit refund");
            ServiceError::DatabaseError(e)
        })?;

        self.emit(Event::OrderRefunded {
            order_id,
            transaction_id: refund.id,
        })
        .await;
        info!(order_id = %order_id, refund_id = %refund.id, amount = %refund.amount, "Order refunded");
        Ok(RefundOutcome {
            order: refunded,
            refund,
        })
    }

    async fn apply_payment_success(
        &self,
        order: order::Model,
        transaction: payment_transaction::Model,
        verified: &VerifiedCallback,
    ) -> Result<Reconciliation, ServiceError> {
        let transaction = match self
            .ledger
            .complete(
                transaction.id,
                &CallbackOutcome::Success,
                verified.external_transaction_id.clone(),
            )
            .await?
        {
            Some(transaction) => transaction,
            None => {
                return self
                    .resolve_completion_race(order.id, transaction.id, verified)
                    .await
            }
        };

        let order = self.orders.set_total_paid(order.id, transaction.amount).await?;

        let lines = self.order_lines_as_requests(order.id).await?;
        if let Err(commit_error) = self.commit_stock(&lines).await {
            return match commit_error {
                ServiceError::StockCommitConflict(shortages) => {
                    ORDERS_PARKED.inc();
                    warn!(
                        order_id = %order.id,
                        shortage_count = shortages.len(),
                        "Stock commit lost the race, parking order for manual reconciliation"
                    );
                    let parked = self
                        .orders
                        .transition_status(
                            order.id,
                            OrderStatus::PendingProcessing,
                            OrderStatus::ErrorStockUpdateFailed,
                        )
                        .await?;
                    self.orders
                        .clear_active_transaction(order.id, transaction.id)
                        .await?;
                    self.emit(Event::StockCommitFailed {
                        order_id: order.id,
                        transaction_id: transaction.id,
                    })
                    .await;
                    CALLBACKS_RECONCILED.inc();
                    Ok(Reconciliation {
                        order: parked,
                        transaction,
                    })
                }
                other => Err(other),
            };
        }

        let invoice = self
            .invoicing
            .create_for_transaction(&order, &transaction)
            .await?;
        self.orders
            .clear_active_transaction(order.id, transaction.id)
            .await?;
        self.emit(Event::PaymentSucceeded {
            order_id: order.id,
            transaction_id: transaction.id,
            amount: transaction.amount,
        })
        .await;
        CALLBACKS_RECONCILED.inc();
        info!(order_id = %order.id, transaction_id = %transaction.id, invoice_id = %invoice.id, "Payment reconciled");
        Ok(Reconciliation { order, transaction })
    }

    async fn apply_payment_failure(
        &self,
        order: order::Model,
        transaction: payment_transaction::Model,
        verified: &VerifiedCallback,
        result_code: String,
    ) -> Result<Reconciliation, ServiceError> {
        let transaction = match self
            .ledger
            .complete(
                transaction.id,
                &CallbackOutcome::Failed(result_code.clone()),
                verified.external_transaction_id.clone(),
            )
            .await?
        {
            Some(transaction) => transaction,
            None => {
                return self
                    .resolve_completion_race(order.id, transaction.id, verified)
                    .await
            }
        };

        let order = self
            .orders
            .transition_status(
                order.id,
                OrderStatus::PendingPayment,
                OrderStatus::PaymentFailed,
            )
            .await?;
        self.orders
            .clear_active_transaction(order.id, transaction.id)
            .await?;
        self.emit(Event::PaymentFailed {
            order_id: order.id,
            transaction_id: transaction.id,
            reason: result_code.clone(),
        })
        .await;
        CALLBACKS_RECONCILED.inc();
        info!(order_id = %order.id, transaction_id = %transaction.id, result_code = %result_code, "Failed payment reconciled");
        Ok(Reconciliation { order, transaction })
    }

    /// A concurrent duplicate beat us to the ledger CAS. Re-read and settle
    /// for replay or reject as stale.
    async fn resolve_completion_race(
        &self,
        order_id: Uuid,
        transaction_id: Uuid,
        verified: &VerifiedCallback,
    ) -> Result<Reconciliation, ServiceError> {
        let transaction = self
            .ledger
            .find_by_id(transaction_id)
            .await?
            .ok_or_else(|| {
                ServiceError::UnknownOrStaleTransaction(transaction_id.to_string())
            })?;
        if transaction.status.is_terminal() && is_identical_replay(&transaction, verified) {
            let order = self.orders.get_order(order_id).await?;
            info!(transaction_id = %transaction_id, "Duplicate callback settled after completion race");
            return Ok(Reconciliation { order, transaction });
        }
        CALLBACK_REJECTIONS.inc();
        warn!(transaction_id = %transaction_id, "Completion race resolved to a conflicting callback");
        Err(ServiceError::UnknownOrStaleTransaction(
            transaction_id.to_string(),
        ))
    }

    async fn operator_transition(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let order = self
            .orders
            .transition_status(order_id, expected.clone(), next)
            .await?;
        self.emit(Event::OrderStatusChanged {
            order_id,
            old_status: expected,
            new_status: order.status.clone(),
        })
        .await;
        info!(order_id = %order_id, status = %order.status, "Operator transition applied");
        Ok(order)
    }

    async fn commit_stock(&self, lines: &[LineRequest]) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start stock commit transaction");
            ServiceError::DatabaseError(e)
        })?;
        self.stock.commit_for_order(&txn, lines).await?;
        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit stock decrement");
            ServiceError::DatabaseError(e)
        })?;
        Ok(())
    }

    async fn order_lines_as_requests(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<LineRequest>, ServiceError> {
        let (_, lines) = self.orders.get_order_with_lines(order_id).await?;
        Ok(lines
            .into_iter()
            .map(|line| LineRequest {
                product_id: line.product_id,
                quantity: line.quantity,
            })
            .collect())
    }

    async fn load_products(
        &self,
        lines: &[LineRequest],
    ) -> Result<Vec<product::Model>, ServiceError> {
        let db = &*self.db_pool;
        let mut product_ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
        product_ids.sort();
        product_ids.dedup();

        let products = product::Entity::find()
            .filter(product::Column::Id.is_in(product_ids.clone()))
            .all(db)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to load products for order placement");
                ServiceError::DatabaseError(e)
            })?;

        for product_id in &product_ids {
            if !products.iter().any(|p| p.id == *product_id) {
                return Err(ServiceError::NotFound(format!(
                    "Product {} not found",
                    product_id
                )));
            }
        }
        Ok(products)
    }

    async fn release_claim(&self, order_id: Uuid, transaction_id: Uuid) {
        if let Err(e) = self
            .orders
            .clear_active_transaction(order_id, transaction_id)
            .await
        {
            error!(error = %e, order_id = %order_id, "Failed to release transaction claim");
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(event_sender) = &self.event_sender {
            if let Err(e) = event_sender.send(event).await {
                warn!(error = %e, "Failed to send event");
            }
        }
    }
}

/// Whether a callback for a settled transaction repeats what the ledger
/// already recorded.
fn is_identical_replay(
    transaction: &payment_transaction::Model,
    verified: &VerifiedCallback,
) -> bool {
    let outcome_matches = matches!(
        (&verified.outcome, &transaction.status),
        (CallbackOutcome::Success, TransactionStatus::Success)
            | (CallbackOutcome::Failed(_), TransactionStatus::Failed)
    );
    let external_matches = match (
        &verified.external_transaction_id,
        &transaction.external_transaction_id,
    ) {
        (None, _) => true,
        (Some(received), Some(recorded)) => received == recorded,
        (Some(_), None) => false,
    };
    outcome_matches && external_matches && verified.amount_minor == transaction.amount_minor
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn settled_charge(status: TransactionStatus) -> payment_transaction::Model {
        let mut txn = payment_transaction::Model::new_charge(
            Uuid::new_v4(),
            Uuid::new_v4(),
            dec!(220000),
            22_000_000,
            "redirect".to_string(),
        );
        txn.status = status;
        txn.external_transaction_id = Some("GW-123".to_string());
        txn
    }

    fn callback(outcome: CallbackOutcome, external: Option<&str>, amount_minor: i64) -> VerifiedCallback {
        VerifiedCallback {
            outcome,
            order_ref: Uuid::new_v4().to_string(),
            external_transaction_id: external.map(|s| s.to_string()),
            amount_minor,
        }
    }

    #[test]
    fn replay_requires_matching_outcome() {
        let txn = settled_charge(TransactionStatus::Success);
        assert!(is_identical_replay(
            &txn,
            &callback(CallbackOutcome::Success, Some("GW-123"), 22_000_000)
        ));
        assert!(!is_identical_replay(
            &txn,
            &callback(CallbackOutcome::Failed("51".into()), Some("GW-123"), 22_000_000)
        ));
    }

    #[test]
    fn replay_requires_matching_external_id_when_present() {
        let txn = settled_charge(TransactionStatus::Success);
        assert!(!is_identical_replay(
            &txn,
            &callback(CallbackOutcome::Success, Some("GW-999"), 22_000_000)
        ));
        // A callback without an external id cannot contradict the record.
        assert!(is_identical_replay(
            &txn,
            &callback(CallbackOutcome::Success, None, 22_000_000)
        ));
    }

    #[test]
    fn replay_requires_matching_amount() {
        let txn = settled_charge(TransactionStatus::Failed);
        assert!(!is_identical_replay(
            &txn,
            &callback(CallbackOutcome::Failed("24".into()), Some("GW-123"), 1)
        ));
    }
}
