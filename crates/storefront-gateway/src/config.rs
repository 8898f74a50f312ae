//! Gateway configuration
//!
//! ## Environment Variables
//!
//! - `STOREFRONT_WS_PONG_WAIT_MS` - Pong wait window in milliseconds (default: 10000)
//! - `STOREFRONT_WS_OTP_RETENTION_MS` - OTP lifetime in milliseconds (default: 5000)
//! - `STOREFRONT_WS_OTP_SWEEP_MS` - OTP sweep tick in milliseconds (default: 400)
//! - `STOREFRONT_WS_MAX_MESSAGE_SIZE` - Maximum inbound frame size in bytes (default: 512)
//! - `STOREFRONT_WS_OUTBOUND_BUFFER` - Per-connection outbound queue size (default: 64)
//! - `STOREFRONT_WS_MAX_CONTENT_LENGTH` - Maximum chat message length in characters (default: 256)
//!
//! The ping interval is not configurable on its own: it is always 9/10 of
//! the pong wait window so at least one ping goes out before the deadline.

use std::{env, time::Duration};

/// Error type for configuration loading
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// How long a connection may stay silent (no pong) before it is dropped
    pub pong_wait: Duration,
    /// How long an issued OTP stays valid
    pub otp_retention: Duration,
    /// How often expired OTPs are swept
    pub otp_sweep_interval: Duration,
    /// Maximum inbound frame size in bytes
    pub max_message_size: usize,
    /// Capacity of each connection's outbound queue
    pub outbound_buffer: usize,
    /// Maximum chat message length in characters
    pub max_content_length: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            pong_wait: Duration::from_secs(10),
            otp_retention: Duration::from_secs(5),
            otp_sweep_interval: Duration::from_millis(400),
            max_message_size: 512,
            outbound_buffer: 64,
            max_content_length: 256,
        }
    }
}

impl GatewayConfig {
    /// Create a builder for constructing a validated `GatewayConfig`
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::new()
    }

    /// Ping interval, 9/10 of the pong wait window
    pub fn ping_interval(&self) -> Duration {
        self.pong_wait * 9 / 10
    }

    /// Load configuration from `STOREFRONT_WS_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = GatewayConfigBuilder::new();

        if let Some(ms) = get_env_u64("STOREFRONT_WS_PONG_WAIT_MS")? {
            builder = builder
                .pong_wait(Duration::from_millis(ms))
                .map_err(|e| env_error("STOREFRONT_WS_PONG_WAIT_MS", e))?;
        }
        if let Some(ms) = get_env_u64("STOREFRONT_WS_OTP_RETENTION_MS")? {
            builder = builder
                .otp_retention(Duration::from_millis(ms))
                .map_err(|e| env_error("STOREFRONT_WS_OTP_RETENTION_MS", e))?;
        }
        if let Some(ms) = get_env_u64("STOREFRONT_WS_OTP_SWEEP_MS")? {
            builder = builder
                .otp_sweep_interval(Duration::from_millis(ms))
                .map_err(|e| env_error("STOREFRONT_WS_OTP_SWEEP_MS", e))?;
        }
        if let Some(size) = get_env_usize("STOREFRONT_WS_MAX_MESSAGE_SIZE")? {
            builder = builder
                .max_message_size(size)
                .map_err(|e| env_error("STOREFRONT_WS_MAX_MESSAGE_SIZE", e))?;
        }
        if let Some(size) = get_env_usize("STOREFRONT_WS_OUTBOUND_BUFFER")? {
            builder = builder
                .outbound_buffer(size)
                .map_err(|e| env_error("STOREFRONT_WS_OUTBOUND_BUFFER", e))?;
        }
        if let Some(len) = get_env_usize("STOREFRONT_WS_MAX_CONTENT_LENGTH")? {
            builder = builder
                .max_content_length(len)
                .map_err(|e| env_error("STOREFRONT_WS_MAX_CONTENT_LENGTH", e))?;
        }

        Ok(builder.build())
    }
}

/// Validated builder for `GatewayConfig`
#[derive(Debug, Clone, Default)]
pub struct GatewayConfigBuilder {
    pong_wait: Option<Duration>,
    otp_retention: Option<Duration>,
    otp_sweep_interval: Option<Duration>,
    max_message_size: Option<usize>,
    outbound_buffer: Option<usize>,
    max_content_length: Option<usize>,
}

impl GatewayConfigBuilder {
    /// Create a new builder with all fields unset (will use defaults on build)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pong wait window (must be between 1s and 300s)
    pub fn pong_wait(mut self, wait: Duration) -> Result<Self, ConfigError> {
        if wait < Duration::from_secs(1) {
            return Err(ConfigError::Invalid(
                "pong_wait must be at least 1 second".to_string(),
            ));
        }
        if wait > Duration::from_secs(300) {
            return Err(ConfigError::Invalid(
                "pong_wait cannot exceed 300 seconds".to_string(),
            ));
        }
        self.pong_wait = Some(wait);
        Ok(self)
    }

    /// Set the OTP lifetime (must be between 100ms and 1h)
    pub fn otp_retention(mut self, retention: Duration) -> Result<Self, ConfigError> {
        if retention < Duration::from_millis(100) {
            return Err(ConfigError::Invalid(
                "otp_retention must be at least 100 milliseconds".to_string(),
            ));
        }
        if retention > Duration::from_secs(3600) {
            return Err(ConfigError::Invalid(
                "otp_retention cannot exceed 1 hour".to_string(),
            ));
        }
        self.otp_retention = Some(retention);
        Ok(self)
    }

    /// Set the OTP sweep tick (must be between 10ms and 60s)
    pub fn otp_sweep_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        if interval < Duration::from_millis(10) {
            return Err(ConfigError::Invalid(
                "otp_sweep_interval must be at least 10 milliseconds".to_string(),
            ));
        }
        if interval > Duration::from_secs(60) {
            return Err(ConfigError::Invalid(
                "otp_sweep_interval cannot exceed 60 seconds".to_string(),
            ));
        }
        self.otp_sweep_interval = Some(interval);
        Ok(self)
    }

    /// Set the maximum inbound frame size (must be between 64 bytes and 1MB)
    pub fn max_message_size(mut self, size: usize) -> Result<Self, ConfigError> {
        if size < 64 {
            return Err(ConfigError::Invalid(
                "max_message_size must be at least 64 bytes".to_string(),
            ));
        }
        if size > 1024 * 1024 {
            return Err(ConfigError::Invalid(
                "max_message_size cannot exceed 1MB (1,048,576 bytes)".to_string(),
            ));
        }
        self.max_message_size = Some(size);
        Ok(self)
    }

    /// Set the outbound queue capacity (must be between 1 and 10,000)
    pub fn outbound_buffer(mut self, size: usize) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::Invalid(
                "outbound_buffer must be at least 1".to_string(),
            ));
        }
        if size > 10_000 {
            return Err(ConfigError::Invalid(
                "outbound_buffer cannot exceed 10,000".to_string(),
            ));
        }
        self.outbound_buffer = Some(size);
        Ok(self)
    }

    /// Set the maximum chat message length (must be between 1 and 4,096)
    pub fn max_content_length(mut self, len: usize) -> Result<Self, ConfigError> {
        if len == 0 || len > 4096 {
            return Err(ConfigError::Invalid(
                "max_content_length must be between 1 and 4,096".to_string(),
            ));
        }
        self.max_content_length = Some(len);
        Ok(self)
    }

    /// Build the `GatewayConfig` (uses defaults for unset fields)
    pub fn build(self) -> GatewayConfig {
        let defaults = GatewayConfig::default();

        GatewayConfig {
            pong_wait: self.pong_wait.unwrap_or(defaults.pong_wait),
            otp_retention: self.otp_retention.unwrap_or(defaults.otp_retention),
            otp_sweep_interval: self
                .otp_sweep_interval
                .unwrap_or(defaults.otp_sweep_interval),
            max_message_size: self.max_message_size.unwrap_or(defaults.max_message_size),
            outbound_buffer: self.outbound_buffer.unwrap_or(defaults.outbound_buffer),
            max_content_length: self
                .max_content_length
                .unwrap_or(defaults.max_content_length),
        }
    }
}

fn env_error(key: &str, err: ConfigError) -> ConfigError {
    let message = match err {
        ConfigError::Invalid(message) => message,
        ConfigError::InvalidEnvVar { message, .. } => message,
    };
    ConfigError::InvalidEnvVar {
        key: key.to_string(),
        message,
    }
}

fn get_env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid u64 value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

fn get_env_usize(key: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid usize value '{val}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}
