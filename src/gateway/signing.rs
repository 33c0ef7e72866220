//! Canonical parameter signing shared by all gateway adapters.
//!
//! The canonical string is the percent-encoded `key=value` pairs, sorted by
//! key byte-wise ascending and joined with `&`, excluding the `signature`
//! parameter itself. A redirect URL's query is exactly this string with the
//! signature appended, so initiation and verification agree by construction.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

use super::GatewayError;

type HmacSha256 = Hmac<Sha256>;

/// Parameter names of the gateway wire protocol.
pub const PARAM_MERCHANT_CODE: &str = "merchant_code";
pub const PARAM_AMOUNT: &str = "amount";
pub const PARAM_ORDER_REF: &str = "order_ref";
pub const PARAM_ORDER_INFO: &str = "order_info";
pub const PARAM_RETURN_URL: &str = "return_url";
pub const PARAM_CURRENCY: &str = "currency";
pub const PARAM_CREATE_TS: &str = "create_ts";
pub const PARAM_EXPIRE_TS: &str = "expire_ts";
pub const PARAM_RESULT_CODE: &str = "result_code";
pub const PARAM_GATEWAY_TXN_ID: &str = "gw_txn_id";
pub const PARAM_SIGNATURE: &str = "signature";

/// Builds the canonical query string over all parameters except the
/// signature itself.
pub fn canonical_query(params: &HashMap<String, String>) -> String {
    let mut sorted: Vec<(&String, &String)> = params
        .iter()
        .filter(|(key, _)| key.as_str() != PARAM_SIGNATURE)
        .collect();
    // String comparison is byte-wise, which is exactly the required order.
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in sorted {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Computes the lowercase hex HMAC-SHA256 signature over the canonical
/// query.
pub fn sign(params: &HashMap<String, String>, secret: &str) -> String {
    let canonical = canonical_query(params);
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Checks the `signature` parameter against a recomputed signature,
/// comparing in constant time.
pub fn verify(params: &HashMap<String, String>, secret: &str) -> bool {
    match params.get(PARAM_SIGNATURE) {
        Some(provided) => constant_time_eq(&sign(params, secret), provided),
        None => false,
    }
}

/// Callback fields after signature verification, before result-code mapping.
#[derive(Debug, Clone)]
pub struct RawCallback {
    pub order_ref: String,
    pub external_transaction_id: Option<String>,
    pub amount_minor: i64,
    pub result_code: String,
}

/// Verifies the callback signature and extracts the mandatory fields.
/// The signature check comes first: an unsigned or tampered callback is
/// rejected before any field is even looked at.
pub fn verify_and_extract(
    params: &HashMap<String, String>,
    secret: &str,
) -> Result<RawCallback, GatewayError> {
    if !verify(params, secret) {
        return Err(GatewayError::InvalidSignature);
    }

    let order_ref = params
        .get(PARAM_ORDER_REF)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GatewayError::MalformedCallback(PARAM_ORDER_REF.to_string()))?
        .clone();

    let amount_minor = params
        .get(PARAM_AMOUNT)
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| GatewayError::MalformedCallback(PARAM_AMOUNT.to_string()))?;

    let result_code = params
        .get(PARAM_RESULT_CODE)
        .ok_or_else(|| GatewayError::MalformedCallback(PARAM_RESULT_CODE.to_string()))?
        .clone();

    let external_transaction_id = params
        .get(PARAM_GATEWAY_TXN_ID)
        .filter(|v| !v.is_empty())
        .cloned();

    Ok(RawCallback {
        order_ref,
        external_transaction_id,
        amount_minor,
        result_code,
    })
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}
