use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "VND";
/// Gateway amounts are expressed in the smallest currency unit.
pub const DEFAULT_MINOR_UNIT_FACTOR: i64 = 100;
const DEFAULT_PAYMENT_EXPIRE_MINUTES: i64 = 15;
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_GATEWAY_MAX_RETRIES: u32 = 3;
const DEFAULT_GATEWAY_RETRY_BACKOFF_MS: u64 = 200;

/// Payment gateway configuration shared by the redirect and card adapters.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Merchant code issued by the gateway operator
    pub merchant_code: String,

    /// Pre-shared HMAC secret for signing and verifying parameters
    pub secret_key: String,

    /// URL the gateway redirects the shopper back to
    pub return_url: String,

    /// Base URL of the hosted payment page (redirect flow)
    pub payment_url: String,

    /// Capture endpoint of the card processor (direct flow)
    #[serde(default)]
    pub capture_endpoint: Option<String>,

    /// Per-request timeout for gateway HTTP calls (seconds)
    #[serde(default = "default_gateway_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum connect attempts against the card processor
    #[serde(default = "default_gateway_max_retries")]
    #[validate(custom = "validate_max_retries")]
    pub max_retries: u32,

    /// Linear backoff between retries (milliseconds)
    #[serde(default = "default_gateway_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Minutes a pending payment stays valid before the gateway expires it
    #[serde(default = "default_payment_expire_minutes")]
    #[validate(custom = "validate_expire_minutes")]
    pub payment_expire_minutes: i64,

    /// ISO currency code sent with every gateway request
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Multiplier from whole currency units to the gateway's minor units
    #[serde(default = "default_minor_unit_factor")]
    pub minor_unit_factor: i64,
}

impl GatewayConfig {
    /// Returns an error naming the first missing mandatory field, if any.
    pub fn check_complete(&self) -> Result<(), String> {
        if self.merchant_code.trim().is_empty() {
            return Err("merchant_code is not configured".into());
        }
        if self.secret_key.trim().is_empty() {
            return Err("secret_key is not configured".into());
        }
        if self.return_url.trim().is_empty() {
            return Err("return_url is not configured".into());
        }
        if self.payment_url.trim().is_empty() {
            return Err("payment_url is not configured".into());
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            merchant_code: String::new(),
            secret_key: String::new(),
            return_url: String::new(),
            payment_url: String::new(),
            capture_endpoint: None,
            request_timeout_secs: default_gateway_timeout_secs(),
            max_retries: default_gateway_max_retries(),
            retry_backoff_ms: default_gateway_retry_backoff_ms(),
            payment_expire_minutes: default_payment_expire_minutes(),
            currency: default_currency(),
            minor_unit_factor: default_minor_unit_factor(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Payment gateway settings
    #[serde(default)]
    #[validate]
    pub gateway: GatewayConfig,
}

impl AppConfig {
    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Creates a new configuration with defaults for everything but the essentials
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            gateway: GatewayConfig::default(),
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_minor_unit_factor() -> i64 {
    DEFAULT_MINOR_UNIT_FACTOR
}

fn default_payment_expire_minutes() -> i64 {
    DEFAULT_PAYMENT_EXPIRE_MINUTES
}

fn default_gateway_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_SECS
}

fn default_gateway_max_retries() -> u32 {
    DEFAULT_GATEWAY_MAX_RETRIES
}

fn default_gateway_retry_backoff_ms() -> u64 {
    DEFAULT_GATEWAY_RETRY_BACKOFF_MS
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

fn validate_max_retries(retries: u32) -> Result<(), ValidationError> {
    if retries == 0 {
        let mut err = ValidationError::new("max_retries");
        err.message = Some("max_retries must be at least 1".into());
        return Err(err);
    }
    Ok(())
}

fn validate_expire_minutes(minutes: i64) -> Result<(), ValidationError> {
    if minutes <= 0 {
        let mut err = ValidationError::new("payment_expire_minutes");
        err.message = Some("payment_expire_minutes must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("mediastore_orders={}", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://mediastore.db?mode=rwc")?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite://mediastore.db?mode=rwc".into(),
            "development".into(),
        )
    }

    #[test]
    fn defaults_validate() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert!(cfg.is_development());
        assert!(!cfg.is_production());
    }

    #[test]
    fn bad_log_level_rejected() {
        let mut cfg = base_config();
        cfg.log_level = "verbose".into();
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("log_level"));
    }

    #[test]
    fn zero_event_capacity_rejected() {
        let mut cfg = base_config();
        cfg.event_channel_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn gateway_completeness_names_missing_field() {
        let gw = GatewayConfig::default();
        let err = gw.check_complete().unwrap_err();
        assert!(err.contains("merchant_code"));

        let gw = GatewayConfig {
            merchant_code: "MEDIA01".into(),
            secret_key: "topsecret".into(),
            return_url: "https://shop.example.com/payment/return".into(),
            payment_url: "https://gw.example.com/pay".into(),
            ..GatewayConfig::default()
        };
        assert!(gw.check_complete().is_ok());
    }

    #[test]
    fn zero_retries_rejected() {
        let mut cfg = base_config();
        cfg.gateway.max_retries = 0;
        assert!(cfg.validate().is_err());
    }
}
