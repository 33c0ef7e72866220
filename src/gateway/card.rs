use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::signing;
use super::{
    CallbackOutcome, GatewayError, GatewayKind, InitiateRequest, InitiatedPayment, PaymentGateway,
    VerifiedCallback, RESULT_CODE_SUCCESS,
};
use crate::config::GatewayConfig;

/// Direct-capture card gateway: the charge is posted straight to the
/// processor's capture endpoint. The processor may require an extra
/// verification step, in which case it hands back a redirect URL. The
/// authoritative outcome still arrives as a signed callback, verified
/// exactly like the redirect flow.
#[derive(Debug)]
pub struct CardGateway {
    config: GatewayConfig,
    capture_endpoint: String,
    client: reqwest::Client,
}

/// Immediate processor acknowledgment of a capture request.
#[derive(Debug, Deserialize)]
struct CaptureResponse {
    /// Processor-side transaction reference.
    gw_txn_id: String,
    /// Verification page the shopper must visit first, if any.
    #[serde(default)]
    verify_url: Option<String>,
}

impl CardGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        config
            .check_complete()
            .map_err(GatewayError::MissingConfig)?;

        let capture_endpoint = config
            .capture_endpoint
            .clone()
            .filter(|endpoint| !endpoint.trim().is_empty())
            .ok_or_else(|| GatewayError::MissingConfig("capture_endpoint".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Ok(Self {
            config: config.clone(),
            capture_endpoint,
            client,
        })
    }

    async fn post_capture(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<CaptureResponse, GatewayError> {
        for attempt in 1..=self.config.max_retries {
            match self
                .client
                .post(&self.capture_endpoint)
                .form(params)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        return Err(GatewayError::Unavailable(format!(
                            "processor returned {}",
                            status
                        )));
                    }
                    return response.json::<CaptureResponse>().await.map_err(|e| {
                        GatewayError::Unavailable(format!("malformed processor response: {}", e))
                    });
                }
                Err(err) if err.is_timeout() => return Err(GatewayError::Timeout),
                Err(err) if err.is_connect() && attempt < self.config.max_retries => {
                    warn!(attempt, error = %err, "processor connect failed, retrying");
                    tokio::time::sleep(Duration::from_millis(
                        self.config.retry_backoff_ms * attempt as u64,
                    ))
                    .await;
                }
                Err(err) => return Err(GatewayError::Unavailable(err.to_string())),
            }
        }

        Err(GatewayError::Unavailable("capture retries exhausted".to_string()))
    }
}

#[async_trait]
impl PaymentGateway for CardGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::Card
    }

    async fn initiate(&self, req: &InitiateRequest) -> Result<InitiatedPayment, GatewayError> {
        let mut params = super::charge_params(&self.config, req, Utc::now().timestamp());
        let signature = signing::sign(&params, &self.config.secret_key);
        params.insert(signing::PARAM_SIGNATURE.to_string(), signature);

        let response = self.post_capture(&params).await?;
        debug!(
            order_ref = %req.order_ref,
            gw_txn_id = %response.gw_txn_id,
            "capture request accepted"
        );

        Ok(InitiatedPayment {
            redirect_url: response.verify_url,
            external_transaction_id: Some(response.gw_txn_id),
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
