use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tracing::debug;

use super::signing;
use super::{
    CallbackOutcome, GatewayError, GatewayKind, InitiateRequest, InitiatedPayment, PaymentGateway,
    VerifiedCallback, RESULT_CODE_SUCCESS,
};
use crate::config::GatewayConfig;

/// Redirect-based gateway: the shopper is sent to the gateway's hosted
/// payment page via a signed URL and comes back through the return URL.
/// The outcome arrives as a signed callback.
#[derive(Debug)]
pub struct RedirectGateway {
    config: GatewayConfig,
}

impl RedirectGateway {
    /// Fails fast when mandatory merchant configuration is missing; the
    /// engine then refuses to create a transaction at all.
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        config
            .check_complete()
            .map_err(GatewayError::MissingConfig)?;
        Ok(Self {
            config: config.clone(),
        })
    }

    /// The redirect URL's query is the canonical string with the signature
    /// appended, so any verifier re-deriving it gets identical bytes.
    fn signed_redirect_url(&self, req: &InitiateRequest, create_ts: i64) -> String {
        let params = super::charge_params(&self.config, req, create_ts);
        let query = signing::canonical_query(&params);
        let signature = signing::sign(&params, &self.config.secret_key);
        format!(
            "{}?{}&{}={}",
            self.config.payment_url,
            query,
            signing::PARAM_SIGNATURE,
            signature
        )
    }
}

#[async_trait]
impl PaymentGateway for RedirectGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Redirect
    }

    async fn initiate(&self, req: &InitiateRequest) -> Result<InitiatedPayment, GatewayError> {
        let redirect_url = self.signed_redirect_url(req, Utc::now().timestamp());
        debug!(order_ref = %req.order_ref, "built signed redirect URL");

        Ok(InitiatedPayment {
            redirect_url: Some(redirect_url),
            external_transaction_id: None,
        })
    }

    fn verify_callback(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<VerifiedCallback, GatewayError> {
        let raw = signing::verify_and_extract(params, &self.config.secret_key)?;
        Ok(VerifiedCallback {
            outcome: self.map_result_code(&raw.result_code),
            order_ref: raw.order_ref,
            external_transaction_id: raw.external_transaction_id,
            amount_minor: raw.amount_minor,
        })
    }

    fn map_result_code(&self, code: &str) -> CallbackOutcome {
        if code == RESULT_CODE_SUCCESS {
            CallbackOutcome::Success
        } else {
            CallbackOutcome::Failed(code.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> RedirectGateway {
        RedirectGateway::new(&GatewayConfig {
            merchant_code: "MEDIA01".into(),
            secret_key: "topsecret".into(),
            return_url: "https://shop.example.com/payment/return".into(),
            payment_url: "https://gw.example.com/pay".into(),
            payment_expire_minutes: 15,
            ..GatewayConfig::default()
        })
        .unwrap()
    }

    fn request() -> InitiateRequest {
        InitiateRequest {
            order_ref: "7f9c3c1e-0000-0000-0000-000000000001".into(),
            order_info: "Payment for order ORD-7F9C3C1E0000".into(),
            amount_minor: 24_200_000,
        }
    }

    fn parse_query(url: &str) -> HashMap<String, String> {
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
        url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect()
    }

    #[test]
    fn missing_merchant_code_is_fatal() {
        let err = RedirectGateway::new(&GatewayConfig::default()).unwrap_err();
        assert!(matches!(err, GatewayError::MissingConfig(_)));
    }

    #[tokio::test]
    async fn redirect_url_carries_signed_params() {
        let gw = gateway();
        let initiated = gw.initiate(&request()).await.unwrap();
        let url = initiated.redirect_url.unwrap();
        assert!(url.starts_with("https://gw.example.com/pay?"));

        let params = parse_query(&url);
        assert_eq!(params.get("merchant_code").map(String::as_str), Some("MEDIA01"));
        assert_eq!(params.get("amount").map(String::as_str), Some("24200000"));
        assert_eq!(
            params.get("order_ref").map(String::as_str),
            Some("7f9c3c1e-0000-0000-0000-000000000001")
        );
        assert_eq!(params.get("currency").map(String::as_str), Some("VND"));
        assert!(params.contains_key("signature"));

        // The query itself must verify with the shared secret.
        assert!(signing::verify(&params, "topsecret"));
    }

    #[test]
    fn expiry_is_create_plus_configured_window() {
        let gw = gateway();
        let url = gw.signed_redirect_url(&request(), 1_700_000_000);
        let params = parse_query(&url);
        assert_eq!(params.get("create_ts").map(String::as_str), Some("1700000000"));
        assert_eq!(
            params.get("expire_ts").map(String::as_str),
            Some("1700000900")
        );
    }

    #[tokio::test]
    async fn tampering_with_redirect_params_breaks_the_signature() {
        let gw = gateway();
        let initiated = gw.initiate(&request()).await.unwrap();
        let mut params = parse_query(&initiated.redirect_url.unwrap());
        params.insert("amount".to_string(), "1".to_string());
        assert!(!signing::verify(&params, "topsecret"));
    }

    #[test]
    fn result_codes_map_to_outcomes() {
        let gw = gateway();
        assert_eq!(gw.map_result_code("00"), CallbackOutcome::Success);
        assert_eq!(
            gw.map_result_code("24"),
            CallbackOutcome::Failed("24".to_string())
        );
    }
}
