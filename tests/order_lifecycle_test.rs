//! End-to-end tests for order placement and the lifecycle state machine.
//!
//! Covers:
//! - Placement with stock validation and fee quoting
//! - Rejected placements (shortages, rush ineligibility, bad input)
//! - Operator transitions (approve, reject, ship, deliver)
//! - Cancellation with stock release
//! - Refunds recorded in the ledger

mod common;

use common::TestApp;
use rust_decimal_macros::dec;
use uuid::Uuid;

use mediastore_orders::entities::order::OrderStatus;
use mediastore_orders::entities::payment_method::PaymentMethodType;
use mediastore_orders::entities::payment_transaction::{TransactionStatus, TransactionType};
use mediastore_orders::gateway::{CallbackOutcome, GatewayKind, RESULT_CODE_SUCCESS};
use mediastore_orders::services::{LineRequest, PlaceOrderRequest};
use mediastore_orders::ServiceError;

// ==================== Placement ====================

#[tokio::test]
async fn place_order_quotes_fees_and_lands_in_pending_payment() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-001", dec!(100000), dec!(0.5), true, 5)
        .await;

    let order = app.place_order(product.id, 2).await;

    assert_eq!(order.status, OrderStatus::PendingPayment);
    assert_eq!(order.subtotal, dec!(200000));
    assert_eq!(order.vat_amount, dec!(20000));
    // Hanoi, 1.0 kg total: base inner-city fee minus the full rebate.
    assert_eq!(order.shipping_fee, dec!(0));
    assert_eq!(order.total, dec!(220000));
    assert!(order.total_paid.is_none());
    assert!(order.active_transaction_id.is_none());

    // Stock is only reserved logically; the decrement happens at payment.
    assert_eq!(app.product_available(product.id).await, 5);

    let (_, lines) = app
        .engine
        .orders()
        .get_order_with_lines(order.id)
        .await
        .expect("order with lines");
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].product_id, product.id);
    assert_eq!(lines[0].quantity, 2);
    assert_eq!(lines[0].unit_price, dec!(100000));
}

#[tokio::test]
async fn placement_rejects_shortages_without_persisting() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-002", dec!(100000), dec!(0.5), true, 1)
        .await;

    let err = app
        .engine
        .place_order(PlaceOrderRequest {
            lines: vec![LineRequest {
                product_id: product.id,
                quantity: 2,
            }],
            delivery: common::delivery_details(),
            rush_order: false,
        })
        .await
        .unwrap_err();

    match err {
        ServiceError::InsufficientStock(shortages) => {
            assert_eq!(shortages.len(), 1);
            assert_eq!(shortages[0].product_id, product.id);
            assert_eq!(shortages[0].requested, 2);
            assert_eq!(shortages[0].available, 1);
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // Nothing was written.
    assert_eq!(app.product_available(product.id).await, 1);
    let orders = app.list_orders().await;
    assert!(orders.is_empty());
}

#[tokio::test]
async fn placement_rejects_unknown_product() {
    let app = TestApp::new().await;

    let err = app
        .engine
        .place_order(PlaceOrderRequest {
            lines: vec![LineRequest {
                product_id: Uuid::new_v4(),
                quantity: 1,
            }],
            delivery: common::delivery_details(),
            rush_order: false,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn placement_rejects_empty_order() {
    let app = TestApp::new().await;

    let err = app
        .engine
        .place_order(PlaceOrderRequest {
            lines: vec![],
            delivery: common::delivery_details(),
            rush_order: false,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn placement_rejects_invalid_phone() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-003", dec!(50000), dec!(0.3), true, 3)
        .await;

    let mut delivery = common::delivery_details();
    delivery.phone = "not-a-phone".to_string();

    let err = app
        .engine
        .place_order(PlaceOrderRequest {
            lines: vec![LineRequest {
                product_id: product.id,
                quantity: 1,
            }],
            delivery,
            rush_order: false,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::ValidationError(_)));
}

#[tokio::test]
async fn rush_order_requires_every_line_eligible() {
    let app = TestApp::new().await;
    let eligible = app
        .seed_product("CD-010", dec!(100000), dec!(0.5), true, 5)
        .await;
    let ineligible = app
        .seed_product("BOOK-011", dec!(80000), dec!(0.8), false, 5)
        .await;

    let err = app
        .engine
        .place_order(PlaceOrderRequest {
            lines: vec![
                LineRequest {
                    product_id: eligible.id,
                    quantity: 1,
                },
                LineRequest {
                    product_id: ineligible.id,
                    quantity: 1,
                },
            ],
            delivery: common::delivery_details(),
            rush_order: true,
        })
        .await
        .unwrap_err();

    match err {
        ServiceError::RushIneligible(ids) => assert_eq!(ids, vec![ineligible.id]),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn rush_order_adds_per_unit_surcharge() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-012", dec!(100000), dec!(0.5), true, 5)
        .await;

    let order = app
        .engine
        .place_order(PlaceOrderRequest {
            lines: vec![LineRequest {
                product_id: product.id,
                quantity: 2,
            }],
            delivery: common::delivery_details(),
            rush_order: true,
        })
        .await
        .expect("rush order placed");

    // Same quote as the non-rush case plus 10 000 per unit.
    assert_eq!(order.shipping_fee, dec!(20000));
    assert_eq!(order.total, dec!(240000));
    assert!(order.rush_order);
}

// ==================== Operator transitions ====================

#[tokio::test]
async fn paid_order_walks_approve_ship_deliver() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-020", dec!(100000), dec!(0.5), true, 5)
        .await;
    let order = app.place_order(product.id, 1).await;
    app.pay_order(order.id).await;

    let approved = app.engine.approve_order(order.id).await.expect("approve");
    assert_eq!(approved.status, OrderStatus::Approved);

    let shipped = app.engine.mark_shipped(order.id).await.expect("ship");
    assert_eq!(shipped.status, OrderStatus::Shipping);

    let delivered = app.engine.mark_delivered(order.id).await.expect("deliver");
    assert_eq!(delivered.status, OrderStatus::Delivered);
}

#[tokio::test]
async fn reject_is_terminal() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-021", dec!(100000), dec!(0.5), true, 5)
        .await;
    let order = app.place_order(product.id, 1).await;
    app.pay_order(order.id).await;

    let rejected = app.engine.reject_order(order.id).await.expect("reject");
    assert_eq!(rejected.status, OrderStatus::Rejected);

    let err = app.engine.approve_order(order.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::IllegalTransition { .. }));
    assert_eq!(app.reload_order(order.id).await.status, OrderStatus::Rejected);
}

#[tokio::test]
async fn unpaid_order_cannot_be_approved() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-022", dec!(100000), dec!(0.5), true, 5)
        .await;
    let order = app.place_order(product.id, 1).await;

    let err = app.engine.approve_order(order.id).await.unwrap_err();
    match err {
        ServiceError::IllegalTransition { from, to } => {
            assert_eq!(from, OrderStatus::PendingPayment);
            assert_eq!(to, OrderStatus::Approved);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(
        app.reload_order(order.id).await.status,
        OrderStatus::PendingPayment
    );
}

#[tokio::test]
async fn delivery_cannot_skip_shipping() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-023", dec!(100000), dec!(0.5), true, 5)
        .await;
    let order = app.place_order(product.id, 1).await;
    app.pay_order(order.id).await;
    app.engine.approve_order(order.id).await.expect("approve");

    let err = app.engine.mark_delivered(order.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::IllegalTransition { .. }));
    assert_eq!(app.reload_order(order.id).await.status, OrderStatus::Approved);
}

// ==================== Cancellation ====================

#[tokio::test]
async fn cancel_approved_order_restores_stock() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-030", dec!(100000), dec!(0.5), true, 5)
        .await;
    let order = app.place_order(product.id, 3).await;
    app.pay_order(order.id).await;
    assert_eq!(app.product_available(product.id).await, 2);

    app.engine.approve_order(order.id).await.expect("approve");
    let cancelled = app.engine.cancel_order(order.id).await.expect("cancel");

    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(app.product_available(product.id).await, 5);
}

#[tokio::test]
async fn cancel_before_payment_is_illegal() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-031", dec!(100000), dec!(0.5), true, 5)
        .await;
    let order = app.place_order(product.id, 1).await;

    // PendingPayment has no edge to Cancelled; the shopper abandons instead.
    let err = app.engine.cancel_order(order.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::IllegalTransition { .. }));
}

#[tokio::test]
async fn cancel_is_blocked_while_payment_in_flight() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-032", dec!(100000), dec!(0.5), true, 5)
        .await;
    let method = app
        .seed_payment_method(PaymentMethodType::DomesticDebitCard)
        .await;
    let order = app.place_order(product.id, 1).await;

    app.engine
        .initiate_payment(order.id, method.id)
        .await
        .expect("initiate");

    let err = app.engine.cancel_order(order.id).await.unwrap_err();
    match err {
        ServiceError::PaymentAlreadyInProgress(id) => assert_eq!(id, order.id),
        other => panic!("unexpected error: {:?}", other),
    }
}

// ==================== Refunds ====================

#[tokio::test]
async fn refund_after_delivery_records_ledger_row() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-040", dec!(100000), dec!(0.5), true, 5)
        .await;
    let order = app.place_order(product.id, 1).await;
    app.pay_order(order.id).await;
    app.engine.approve_order(order.id).await.expect("approve");
    app.engine.mark_shipped(order.id).await.expect("ship");
    app.engine.mark_delivered(order.id).await.expect("deliver");

    let outcome = app
        .engine
        .refund_order(order.id, Some("damaged in transit".to_string()))
        .await
        .expect("refund");

    assert_eq!(outcome.order.status, OrderStatus::Refunded);
    assert_eq!(outcome.refund.transaction_type, TransactionType::Refund);
    assert_eq!(outcome.refund.status, TransactionStatus::Success);
    assert_eq!(outcome.refund.amount, outcome.order.total);

    // The ledger keeps the original charge and the refund.
    let ledger = app
        .engine
        .ledger()
        .find_for_order(order.id)
        .await
        .expect("ledger rows");
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger[0].transaction_type, TransactionType::Charge);
    assert_eq!(ledger[1].transaction_type, TransactionType::Refund);
}

#[tokio::test]
async fn refund_requires_a_successful_charge() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-041", dec!(100000), dec!(0.5), true, 5)
        .await;
    let order = app.place_order(product.id, 1).await;

    let err = app.engine.refund_order(order.id, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidOperation(_)));
}

#[tokio::test]
async fn refund_is_terminal() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-042", dec!(100000), dec!(0.5), true, 5)
        .await;
    let order = app.place_order(product.id, 1).await;
    app.pay_order(order.id).await;
    app.engine.approve_order(order.id).await.expect("approve");
    app.engine
        .refund_order(order.id, None)
        .await
        .expect("refund");

    let err = app.engine.mark_shipped(order.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::IllegalTransition { .. }));
    let err = app.engine.refund_order(order.id, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::IllegalTransition { .. }));
}

// ==================== Payment retry path ====================

#[tokio::test]
async fn failed_payment_can_be_retried() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("CD-050", dec!(100000), dec!(0.5), true, 5)
        .await;
    let method = app
        .seed_payment_method(PaymentMethodType::DomesticDebitCard)
        .await;
    let order = app.place_order(product.id, 1).await;

    // First attempt fails at the gateway.
    let initiation = app
        .engine
        .initiate_payment(order.id, method.id)
        .await
        .expect("initiate");
    let params = app.signed_callback(
        initiation.transaction_id,
        app.order_amount_minor(order.id).await,
        "24",
        "GW-FIRST",
    );
    let reconciled = app
        .engine
        .reconcile(GatewayKind::Redirect, &params)
        .await
        .expect("reconcile failure");
    assert_eq!(reconciled.order.status, OrderStatus::PaymentFailed);
    assert_eq!(reconciled.transaction.status, TransactionStatus::Failed);
    assert_eq!(
        reconciled.transaction.failure_reason.as_deref(),
        Some("24")
    );
    // Stock was never touched by the failed attempt.
    assert_eq!(app.product_available(product.id).await, 5);

    // Second attempt succeeds.
    let initiation = app
        .engine
        .initiate_payment(order.id, method.id)
        .await
        .expect("re-initiate");
    let params = app.signed_callback(
        initiation.transaction_id,
        app.order_amount_minor(order.id).await,
        RESULT_CODE_SUCCESS,
        "GW-SECOND",
    );
    let reconciled = app
        .engine
        .reconcile(GatewayKind::Redirect, &params)
        .await
        .expect("reconcile success");
    assert_eq!(reconciled.order.status, OrderStatus::PendingProcessing);
    assert_eq!(reconciled.transaction.status, TransactionStatus::Success);
    assert_eq!(app.product_available(product.id).await, 4);

    // Both attempts stay on the ledger.
    let ledger = app
        .engine
        .ledger()
        .find_for_order(order.id)
        .await
        .expect("ledger rows");
    assert_eq!(ledger.len(), 2);
    assert!(matches!(
        app.engine
            .ledger()
            .find_by_id(initiation.transaction_id)
            .await
            .expect("find")
            .map(|t| t.status),
        Some(TransactionStatus::Success)
    ));
}

#[tokio::test]
async fn result_code_mapping_drives_the_outcome() {
    let app = TestApp::new().await;
    let registry = mediastore_orders::gateway::GatewayRegistry::from_config(&app.gateway_config)
        .expect("registry");
    let adapter = registry
        .by_kind(GatewayKind::Redirect)
        .expect("redirect adapter");

    assert_eq!(
        adapter.map_result_code(RESULT_CODE_SUCCESS),
        CallbackOutcome::Success
    );
    assert_eq!(
        adapter.map_result_code("51"),
        CallbackOutcome::Failed("51".to_string())
    );
}
