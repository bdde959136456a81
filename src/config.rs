//! Configuration management for pkjwt.
//!
//! Settings come from an optional `config.yaml` and `PKJWT_` prefixed
//! environment variables, the latter taking precedence.

use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::Deserialize;

use crate::jwt::AssertionConfig;
use crate::key::MIN_RSA_BITS;

/// Application configuration settings.
#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    /// Issuer base URL (e.g., "http://localhost:8080/auth/realms/master").
    pub issuer: String,
    /// Port the JWKS endpoint listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Token endpoint. When unset it is discovered from the issuer.
    #[serde(default)]
    pub token_url: Option<String>,
    /// Scopes requested in the client credentials exchange.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Whether outbound token traffic is dumped to the log.
    #[serde(default = "default_true")]
    pub debug_transport: bool,
    #[serde(default)]
    pub assertion: AssertionSettings,
    #[serde(default)]
    pub key: KeySettings,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub refresh: RefreshSettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Settings {
    /// Claims template for client assertions. An empty audience defaults to
    /// the issuer itself.
    pub fn assertion_config(&self) -> AssertionConfig {
        let audience = if self.assertion.audience.is_empty() {
            vec![self.issuer.clone()]
        } else {
            self.assertion.audience.clone()
        };

        AssertionConfig {
            issuer: Some(
                self.assertion
                    .issuer
                    .clone()
                    .unwrap_or_else(|| self.issuer.clone()),
            ),
            subject: self.assertion.subject.clone(),
            audience,
            id: self.assertion.id.clone(),
            unique_id: self.assertion.unique_id,
            lifetime: match self.assertion.lifetime_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

/// Claims asserted by this client.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AssertionSettings {
    /// Must match the client ID registered with the issuer.
    pub subject: String,
    pub issuer: Option<String>,
    pub audience: Vec<String>,
    pub id: Option<String>,
    pub unique_id: bool,
    /// `0` leaves `exp` out of the assertion.
    pub lifetime_secs: u64,
}

impl Default for AssertionSettings {
    fn default() -> Self {
        Self {
            subject: "telemeter".to_string(),
            issuer: None,
            audience: Vec::new(),
            id: None,
            unique_id: true,
            lifetime_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct KeySettings {
    pub bits: usize,
    pub algorithm: Algorithm,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            bits: MIN_RSA_BITS,
            algorithm: Algorithm::RS256,
        }
    }
}

/// Limits of the outbound HTTP client.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 20,
            pool_max_idle_per_host: 10,
            pool_idle_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// Wait between successful token exchanges.
    pub interval_secs: u64,
    /// Hand out a still valid credential instead of exchanging again.
    pub reuse_token: bool,
    pub retry: RetrySettings,
}

impl RefreshSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            reuse_token: false,
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicyKind {
    #[default]
    FailFast,
    ExponentialBackoff,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub policy: RetryPolicyKind,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            policy: RetryPolicyKind::FailFast,
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
            max_attempts: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LoggingFormat {
    Json,
    Pretty,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub level: LogLevel,
    pub axum_level: LogLevel,
    /// Level for `reqwest` and `hyper` internals.
    pub http_level: LogLevel,
    pub format: LoggingFormat,
    pub otlp_enabled: bool,
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            axum_level: LogLevel::Warn,
            http_level: LogLevel::Warn,
            format: LoggingFormat::Pretty,
            otlp_enabled: false,
            service_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

fn default_port() -> u16 {
    8888
}

fn default_true() -> bool {
    true
}

/// Loads configuration from `config.yaml` (if present) and the environment.
///
/// # Errors
/// Fails if a source cannot be read or required settings such as `issuer`
/// are missing.
#[tracing::instrument]
pub fn load_config() -> Result<Settings, config::ConfigError> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(
            config::Environment::with_prefix("PKJWT")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("scopes")
                .with_list_parse_key("assertion.audience")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| {
            tracing::error!("Failed to build configuration: {}", e);
            e
        })?;

    cfg.try_deserialize::<Settings>().map_err(|e| {
        tracing::error!("Failed to deserialize configuration: {}", e);
        e
    })
}
