#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, IntoActiveModel};
use tempfile::TempDir;
use uuid::Uuid;

use mediastore_orders::config::GatewayConfig;
use mediastore_orders::db::{self, DbConfig, DbPool};
use mediastore_orders::entities::payment_method::PaymentMethodType;
use mediastore_orders::entities::{order, payment_method, product};
use mediastore_orders::events;
use mediastore_orders::gateway::{
    signing, to_minor_units, GatewayKind, GatewayRegistry, RESULT_CODE_SUCCESS,
};
use mediastore_orders::services::{
    DeliveryDetails, LineRequest, OrderLifecycleEngine, PlaceOrderRequest, Reconciliation,
};

/// Test harness: a fresh SQLite database with migrations applied and the
/// lifecycle engine wired over it.
pub struct TestApp {
    pub pool: Arc<DbPool>,
    pub engine: OrderLifecycleEngine,
    pub gateway_config: GatewayConfig,
    _event_task: tokio::task::JoinHandle<()>,
    _tmp: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_gateway_config(test_gateway_config()).await
    }

    pub async fn with_gateway_config(gateway_config: GatewayConfig) -> Self {
        let registry =
            Arc::new(GatewayRegistry::from_config(&gateway_config).expect("gateway registry"));
        Self::with_registry(registry, gateway_config).await
    }

    /// Wires the engine over pre-built gateway adapters. Used by tests that
    /// stub the gateway side.
    pub async fn with_registry(
        registry: Arc<GatewayRegistry>,
        gateway_config: GatewayConfig,
    ) -> Self {
        let tmp = tempfile::tempdir().expect("temp dir");
        let db_path = tmp.path().join("mediastore_test.db");

        // Single connection: SQLite serializes writers anyway and this keeps
        // lock errors out of the tests.
        let db_config = DbConfig {
            url: format!("sqlite://{}?mode=rwc", db_path.display()),
            max_connections: 1,
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(5),
        };
        let pool = Arc::new(
            db::establish_connection_with_config(&db_config)
                .await
                .expect("database"),
        );
        db::run_migrations(&pool).await.expect("migrations");

        let (event_sender, receiver) = events::channel(64);
        let event_task = tokio::spawn(events::process_events(receiver));
        let engine =
            OrderLifecycleEngine::from_pool(pool.clone(), registry, Some(Arc::new(event_sender)));

        Self {
            pool,
            engine,
            gateway_config,
            _event_task: event_task,
            _tmp: tmp,
        }
    }

    pub async fn seed_product(
        &self,
        sku: &str,
        unit_price: Decimal,
        weight_kg: Decimal,
        rush_eligible: bool,
        available: i32,
    ) -> product::Model {
        product::Model::new(
            sku.to_string(),
            format!("Title for {}", sku),
            "cd".to_string(),
            unit_price,
            weight_kg,
            rush_eligible,
            available,
        )
        .into_active_model()
        .insert(&*self.pool)
        .await
        .expect("seed product")
    }

    pub async fn seed_payment_method(&self, method_type: PaymentMethodType) -> payment_method::Model {
        payment_method::Model::new(method_type, None, "Test method".to_string())
            .into_active_model()
            .insert(&*self.pool)
            .await
            .expect("seed payment method")
    }

    /// Places an order for `quantity` units of one product with a valid
    /// Hanoi delivery address.
    pub async fn place_order(&self, product_id: Uuid, quantity: i32) -> order::Model {
        self.engine
            .place_order(PlaceOrderRequest {
                lines: vec![LineRequest {
                    product_id,
                    quantity,
                }],
                delivery: delivery_details(),
                rush_order: false,
            })
            .await
            .expect("place order")
    }

    /// Runs the whole happy payment path: initiates against the redirect
    /// gateway and reconciles a signed success callback. Leaves the order in
    /// `PendingProcessing` with stock committed.
    pub async fn pay_order(&self, order_id: Uuid) -> Reconciliation {
        let method = self
            .seed_payment_method(PaymentMethodType::DomesticDebitCard)
            .await;
        let initiation = self
            .engine
            .initiate_payment(order_id, method.id)
            .await
            .expect("initiate payment");
        let params = self.signed_callback(
            initiation.transaction_id,
            self.order_amount_minor(order_id).await,
            RESULT_CODE_SUCCESS,
            &format!("GW-{}", initiation.transaction_id.simple()),
        );
        self.engine
            .reconcile(GatewayKind::Redirect, &params)
            .await
            .expect("reconcile success callback")
    }

    /// The order total expressed in the gateway's minor units.
    pub async fn order_amount_minor(&self, order_id: Uuid) -> i64 {
        let order = self.reload_order(order_id).await;
        to_minor_units(order.total, self.gateway_config.minor_unit_factor)
            .expect("total fits in minor units")
    }

    pub async fn product_available(&self, product_id: Uuid) -> i32 {
        product::Entity::find_by_id(product_id)
            .one(&*self.pool)
            .await
            .expect("load product")
            .expect("product exists")
            .available
    }

    pub async fn list_orders(&self) -> Vec<order::Model> {
        order::Entity::find()
            .all(&*self.pool)
            .await
            .expect("list orders")
    }

    pub async fn reload_order(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(&*self.pool)
            .await
            .expect("load order")
            .expect("order exists")
    }

    /// Builds a callback parameter set signed with the configured secret,
    /// the way the gateway would send it.
    pub fn signed_callback(
        &self,
        transaction_id: Uuid,
        amount_minor: i64,
        result_code: &str,
        gateway_txn_id: &str,
    ) -> HashMap<String, String> {
        let mut params = HashMap::new();
        params.insert(
            signing::PARAM_ORDER_REF.to_string(),
            transaction_id.to_string(),
        );
        params.insert(signing::PARAM_AMOUNT.to_string(), amount_minor.to_string());
        params.insert(
            signing::PARAM_RESULT_CODE.to_string(),
            result_code.to_string(),
        );
        params.insert(
            signing::PARAM_GATEWAY_TXN_ID.to_string(),
            gateway_txn_id.to_string(),
        );
        let signature = signing::sign(&params, &self.gateway_config.secret_key);
        params.insert(signing::PARAM_SIGNATURE.to_string(), signature);
        params
    }
}

pub fn test_gateway_config() -> GatewayConfig {
    GatewayConfig {
        merchant_code: "MEDIA01".to_string(),
        secret_key: "test-secret-key".to_string(),
        return_url: "https://shop.test/payment/return".to_string(),
        payment_url: "https://gateway.test/pay".to_string(),
        ..GatewayConfig::default()
    }
}

pub fn delivery_details() -> DeliveryDetails {
    DeliveryDetails {
        recipient_name: "Nguyen Van A".to_string(),
        phone: "0901234567".to_string(),
        email: "a@example.com".to_string(),
        address: "1 Tran Hung Dao".to_string(),
        province: "Hanoi".to_string(),
        message: None,
    }
}
