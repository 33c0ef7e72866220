pub mod card;
pub mod redirect;
pub mod signing;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::GatewayConfig;
use crate::entities::payment_method::PaymentMethodType;
use crate::errors::ServiceError;

pub use card::CardGateway;
pub use redirect::RedirectGateway;

/// Result code gateways send for an approved payment.
pub const RESULT_CODE_SUCCESS: &str = "00";

/// Which adapter family a gateway belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    #[strum(serialize = "redirect")]
    Redirect,
    #[strum(serialize = "card")]
    Card,
}

impl GatewayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayKind::Redirect => "redirect",
            GatewayKind::Card => "card",
        }
    }
}

/// Errors surfaced by gateway adapters.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway configuration incomplete: {0}")]
    MissingConfig(String),

    #[error("callback signature verification failed")]
    InvalidSignature,

    #[error("callback missing or malformed parameter: {0}")]
    MalformedCallback(String),

    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::MissingConfig(field) => ServiceError::GatewayConfig(field),
            GatewayError::InvalidSignature => ServiceError::InvalidSignature,
            GatewayError::MalformedCallback(param) => {
                ServiceError::ValidationError(format!("malformed gateway callback: {}", param))
            }
            GatewayError::Timeout => ServiceError::GatewayTimeout,
            GatewayError::Unavailable(reason) => ServiceError::GatewayUnavailable(reason),
        }
    }
}

/// What the engine asks a gateway to charge.
#[derive(Debug, Clone)]
pub struct InitiateRequest {
    /// Unique reference for this payment attempt (the ledger transaction id).
    pub order_ref: String,
    /// Human-readable description shown on the gateway's payment page.
    pub order_info: String,
    /// Amount in the gateway's smallest currency unit.
    pub amount_minor: i64,
}

/// What a gateway hands back from a successful initiation.
#[derive(Debug, Clone)]
pub struct InitiatedPayment {
    /// Where to send the shopper: the hosted payment page (redirect flow) or
    /// an additional verification page (card flow), if one is required.
    pub redirect_url: Option<String>,
    /// Gateway-side transaction reference, when the gateway assigns one at
    /// initiation time.
    pub external_transaction_id: Option<String>,
}

/// Outcome of mapping a gateway result code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Success,
    Failed(String),
}

/// A callback whose signature has been verified and whose fields parsed.
#[derive(Debug, Clone)]
pub struct VerifiedCallback {
    pub outcome: CallbackOutcome,
    /// Payment attempt reference echoed back by the gateway.
    pub order_ref: String,
    /// Gateway-side transaction reference.
    pub external_transaction_id: Option<String>,
    /// Amount the gateway reports, in minor units.
    pub amount_minor: i64,
}

/// Capability surface of one payment gateway. One implementation per
/// gateway; the registry picks the right one for a payment method.
#[async_trait]
pub trait PaymentGateway: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> GatewayKind;

    /// Starts a payment attempt at the gateway.
    async fn initiate(&self, req: &InitiateRequest) -> Result<InitiatedPayment, GatewayError>;

    /// Verifies a callback's signature and extracts its fields. Pure; must
    /// be called before any state is read or written.
    fn verify_callback(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<VerifiedCallback, GatewayError>;

    /// Maps the gateway's result code to an internal outcome.
    fn map_result_code(&self, code: &str) -> CallbackOutcome;
}

/// Converts a whole-unit amount to the gateway's minor units. `None` when
/// the scaled amount is fractional or does not fit an i64.
pub fn to_minor_units(amount: Decimal, factor: i64) -> Option<i64> {
    use rust_decimal::prelude::ToPrimitive;
    let scaled = amount.checked_mul(Decimal::from(factor))?;
    if scaled.fract() != Decimal::ZERO {
        return None;
    }
    scaled.to_i64()
}

/// Builds the signed parameter set for one charge attempt. Both adapters
/// send exactly this set, so callbacks verify the same way regardless of
/// which flow initiated the payment.
pub(crate) fn charge_params(
    config: &GatewayConfig,
    req: &InitiateRequest,
    create_ts: i64,
) -> HashMap<String, String> {
    let expire_ts = create_ts + config.payment_expire_minutes * 60;

    let mut params = HashMap::new();
    params.insert(
        signing::PARAM_MERCHANT_CODE.to_string(),
        config.merchant_code.clone(),
    );
    params.insert(
        signing::PARAM_AMOUNT.to_string(),
        req.amount_minor.to_string(),
    );
    params.insert(signing::PARAM_ORDER_REF.to_string(), req.order_ref.clone());
    params.insert(
        signing::PARAM_ORDER_INFO.to_string(),
        req.order_info.clone(),
    );
    params.insert(
        signing::PARAM_RETURN_URL.to_string(),
        config.return_url.clone(),
    );
    params.insert(signing::PARAM_CURRENCY.to_string(), config.currency.clone());
    params.insert(signing::PARAM_CREATE_TS.to_string(), create_ts.to_string());
    params.insert(signing::PARAM_EXPIRE_TS.to_string(), expire_ts.to_string());
    params
}

/// Holds the configured adapters and selects one per payment method type.
/// Built once at construction time and injected into the lifecycle engine.
pub struct GatewayRegistry {
    redirect: Arc<dyn PaymentGateway>,
    card: Option<Arc<dyn PaymentGateway>>,
    minor_unit_factor: i64,
}

impl GatewayRegistry {
    /// Builds the registry from gateway configuration. The card adapter is
    /// only registered when a capture endpoint is configured.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let redirect: Arc<dyn PaymentGateway> = Arc::new(RedirectGateway::new(config)?);
        let card: Option<Arc<dyn PaymentGateway>> = match config.capture_endpoint {
            Some(_) => Some(Arc::new(CardGateway::new(config)?)),
            None => None,
        };
        Ok(Self {
            redirect,
            card,
            minor_unit_factor: config.minor_unit_factor,
        })
    }

    /// Assembles a registry from pre-built adapters.
    pub fn with_adapters(
        redirect: Arc<dyn PaymentGateway>,
        card: Option<Arc<dyn PaymentGateway>>,
    ) -> Self {
        Self {
            redirect,
            card,
            minor_unit_factor: crate::config::DEFAULT_MINOR_UNIT_FACTOR,
        }
    }

    /// Resolves the adapter responsible for a payment method type.
    pub fn for_method_type(
        &self,
        method_type: &PaymentMethodType,
    ) -> Result<Arc<dyn PaymentGateway>, GatewayError> {
        match method_type {
            PaymentMethodType::CreditCard => self.by_kind(GatewayKind::Card),
            PaymentMethodType::DomesticDebitCard | PaymentMethodType::Other => {
                self.by_kind(GatewayKind::Redirect)
            }
        }
    }

    /// Currency scale applied when converting ledger amounts to the wire.
    pub fn minor_unit_factor(&self) -> i64 {
        self.minor_unit_factor
    }

    /// Resolves an adapter by kind, for callback routing.
    pub fn by_kind(&self, kind: GatewayKind) -> Result<Arc<dyn PaymentGateway>, GatewayError> {
        match kind {
            GatewayKind::Redirect => Ok(Arc::clone(&self.redirect)),
            GatewayKind::Card => self
                .card
                .as_ref()
                .map(Arc::clone)
                .ok_or_else(|| GatewayError::MissingConfig("capture_endpoint".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_config() -> GatewayConfig {
        GatewayConfig {
            merchant_code: "MEDIA01".into(),
            secret_key: "topsecret".into(),
            return_url: "https://shop.example.com/payment/return".into(),
            payment_url: "https://gw.example.com/pay".into(),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn registry_routes_method_types() {
        let mut config = complete_config();
        config.capture_endpoint = Some("https://processor.example.com/capture".into());
        let registry = GatewayRegistry::from_config(&config).unwrap();

        let adapter = registry
            .for_method_type(&PaymentMethodType::DomesticDebitCard)
            .unwrap();
        assert_eq!(adapter.kind(), GatewayKind::Redirect);

        let adapter = registry
            .for_method_type(&PaymentMethodType::CreditCard)
            .unwrap();
        assert_eq!(adapter.kind(), GatewayKind::Card);

        let adapter = registry.for_method_type(&PaymentMethodType::Other).unwrap();
        assert_eq!(adapter.kind(), GatewayKind::Redirect);
    }

    #[test]
    fn card_route_requires_capture_endpoint() {
        let registry = GatewayRegistry::from_config(&complete_config()).unwrap();
        let err = registry
            .for_method_type(&PaymentMethodType::CreditCard)
            .unwrap_err();
        assert!(matches!(err, GatewayError::MissingConfig(_)));
    }

    #[test]
    fn incomplete_config_is_fatal() {
        let mut config = complete_config();
        config.merchant_code = String::new();
        assert!(matches!(
            GatewayRegistry::from_config(&config),
            Err(GatewayError::MissingConfig(_))
        ));
    }

    #[test]
    fn minor_unit_conversion_scales_whole_amounts() {
        use rust_decimal_macros::dec;
        assert_eq!(to_minor_units(dec!(220000), 100), Some(22_000_000));
        assert_eq!(to_minor_units(dec!(0), 100), Some(0));
        // A sub-unit remainder cannot be represented on the wire.
        assert_eq!(to_minor_units(dec!(100.005), 100), None);
    }
}
