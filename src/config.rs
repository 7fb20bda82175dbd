use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

use crate::models::GatewayKind;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api/v1";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CURRENCY: &str = "INR";
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_SUCCESS_REDIRECT_URL: &str = "/checkout/success";
const DEFAULT_ENTITLEMENT_TTL_SECS: u64 = 300;
const DEFAULT_ESIGN_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_ESIGN_MAX_POLL_ATTEMPTS: u32 = 150;
const DEFAULT_ESIGN_COMPLETION_GRACE_MS: u64 = 2_000;
const DEFAULT_VERIFY_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_VERIFY_BASE_DELAY_MS: u64 = 2_000;

/// Access-profile cache tuning.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct EntitlementConfig {
    /// TTL for the cached access profile, in seconds.
    #[serde(default = "default_entitlement_ttl_secs")]
    #[validate(range(min = 1))]
    pub ttl_secs: u64,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_entitlement_ttl_secs(),
        }
    }
}

/// eSign gate timing. The poll loop is bounded; there is no indefinite poll.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct EsignConfig {
    /// Interval between signing-status polls, in milliseconds.
    #[serde(default = "default_esign_poll_interval_ms")]
    #[validate(range(min = 100))]
    pub poll_interval_ms: u64,

    /// Upper bound on status polls before the pass fails.
    #[serde(default = "default_esign_max_poll_attempts")]
    #[validate(range(min = 1))]
    pub max_poll_attempts: u32,

    /// How long the signing window stays open after completion so the user
    /// sees the provider's confirmation screen, in milliseconds.
    #[serde(default = "default_esign_completion_grace_ms")]
    pub completion_grace_ms: u64,
}

impl Default for EsignConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_esign_poll_interval_ms(),
            max_poll_attempts: default_esign_max_poll_attempts(),
            completion_grace_ms: default_esign_completion_grace_ms(),
        }
    }
}

/// Mandate/payment verification retry tuning.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct VerificationConfig {
    /// Attempt cap before the flow surfaces a verification timeout.
    #[serde(default = "default_verify_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,

    /// Base delay between attempts, in milliseconds. Attempt n waits roughly
    /// n times this value.
    #[serde(default = "default_verify_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Add random jitter to retry delays.
    #[serde(default = "default_true_bool")]
    pub jitter: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_verify_max_attempts(),
            base_delay_ms: default_verify_base_delay_ms(),
            jitter: default_true_bool(),
        }
    }
}

/// Which gateway adapters this deployment offers.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_true_bool")]
    pub hosted_enabled: bool,

    #[serde(default = "default_true_bool")]
    pub direct_enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            hosted_enabled: default_true_bool(),
            direct_enabled: default_true_bool(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Base URL of the platform backend.
    #[serde(default = "default_api_base_url")]
    #[validate(custom = "validate_base_url")]
    pub api_base_url: String,

    /// Per-request timeout for backend calls, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Currency all carts are priced in.
    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Where the surface is sent after a verified payment.
    #[serde(default = "default_success_redirect_url")]
    pub success_redirect_url: String,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    #[serde(default)]
    #[validate]
    pub entitlements: EntitlementConfig,

    #[serde(default)]
    #[validate]
    pub esign: EsignConfig,

    #[serde(default)]
    #[validate]
    pub verification: VerificationConfig,

    #[serde(default)]
    #[validate]
    pub gateways: GatewayConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            environment: default_environment(),
            log_level: default_log_level(),
            log_json: false,
            default_currency: default_currency(),
            success_redirect_url: default_success_redirect_url(),
            event_channel_capacity: default_event_channel_capacity(),
            entitlements: EntitlementConfig::default(),
            esign: EsignConfig::default(),
            verification: VerificationConfig::default(),
            gateways: GatewayConfig::default(),
        }
    }
}

impl AppConfig {
    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn entitlement_ttl(&self) -> Duration {
        Duration::from_secs(self.entitlements.ttl_secs)
    }

    pub fn esign_poll_interval(&self) -> Duration {
        Duration::from_millis(self.esign.poll_interval_ms)
    }

    pub fn esign_completion_grace(&self) -> Duration {
        Duration::from_millis(self.esign.completion_grace_ms)
    }

    pub fn verification_base_delay(&self) -> Duration {
        Duration::from_millis(self.verification.base_delay_ms)
    }

    /// Gateways this deployment offers, before plan eligibility is applied.
    pub fn enabled_gateways(&self) -> Vec<GatewayKind> {
        let mut enabled = Vec::new();
        if self.gateways.hosted_enabled {
            enabled.push(GatewayKind::HostedCheckout);
        }
        if self.gateways.direct_enabled {
            enabled.push(GatewayKind::DirectApi);
        }
        enabled
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_success_redirect_url() -> String {
    DEFAULT_SUCCESS_REDIRECT_URL.to_string()
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

fn default_entitlement_ttl_secs() -> u64 {
    DEFAULT_ENTITLEMENT_TTL_SECS
}

fn default_esign_poll_interval_ms() -> u64 {
    DEFAULT_ESIGN_POLL_INTERVAL_MS
}

fn default_esign_max_poll_attempts() -> u32 {
    DEFAULT_ESIGN_MAX_POLL_ATTEMPTS
}

fn default_esign_completion_grace_ms() -> u64 {
    DEFAULT_ESIGN_COMPLETION_GRACE_MS
}

fn default_verify_max_attempts() -> u32 {
    DEFAULT_VERIFY_MAX_ATTEMPTS
}

fn default_verify_base_delay_ms() -> u64 {
    DEFAULT_VERIFY_BASE_DELAY_MS
}

fn default_true_bool() -> bool {
    true
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

fn validate_base_url(value: &str) -> Result<(), ValidationError> {
    match url::Url::parse(value) {
        Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => Ok(()),
        _ => {
            let mut err = ValidationError::new("api_base_url");
            err.message = Some("Must be an absolute http(s) URL".into());
            Err(err)
        }
    }
}

// validator 0.14 hands Copy scalars to custom validators by value.
fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("advisory_checkout={}", level);
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
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
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
        .set_default("api_base_url", DEFAULT_API_BASE_URL)?
        .set_default("request_timeout_secs", DEFAULT_REQUEST_TIMEOUT_SECS as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .set_default("default_currency", DEFAULT_CURRENCY)?
        .set_default("success_redirect_url", DEFAULT_SUCCESS_REDIRECT_URL)?
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

    #[test]
    fn defaults_pass_validation() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.entitlements.ttl_secs, 300);
        assert_eq!(cfg.verification.max_attempts, 5);
        assert_eq!(cfg.esign.poll_interval_ms, 2_000);
    }

    #[test]
    fn bad_log_level_fails_validation() {
        let cfg = AppConfig {
            log_level: "verbose".into(),
            ..AppConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn relative_api_base_url_fails_validation() {
        let cfg = AppConfig {
            api_base_url: "/api/v1".into(),
            ..AppConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_poll_attempts_fails_validation() {
        let mut cfg = AppConfig::default();
        cfg.esign.max_poll_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_event_channel_capacity_fails_validation() {
        let cfg = AppConfig {
            event_channel_capacity: 0,
            ..AppConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn enabled_gateways_respects_flags() {
        let mut cfg = AppConfig::default();
        assert_eq!(
            cfg.enabled_gateways(),
            vec![GatewayKind::HostedCheckout, GatewayKind::DirectApi]
        );

        cfg.gateways.hosted_enabled = false;
        assert_eq!(cfg.enabled_gateways(), vec![GatewayKind::DirectApi]);

        cfg.gateways.direct_enabled = false;
        assert!(cfg.enabled_gateways().is_empty());
    }

    #[test]
    fn durations_convert_from_config_units() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.entitlement_ttl(), Duration::from_secs(300));
        assert_eq!(cfg.esign_poll_interval(), Duration::from_millis(2_000));
        assert_eq!(cfg.verification_base_delay(), Duration::from_millis(2_000));
    }
}
