//! Integration tests for environment-based configuration

use serial_test::serial;
use std::{env, time::Duration};
use storefront_gateway::{ConfigError, GatewayConfig};

const VARS: [&str; 6] = [
    "STOREFRONT_WS_PONG_WAIT_MS",
    "STOREFRONT_WS_OTP_RETENTION_MS",
    "STOREFRONT_WS_OTP_SWEEP_MS",
    "STOREFRONT_WS_MAX_MESSAGE_SIZE",
    "STOREFRONT_WS_OUTBOUND_BUFFER",
    "STOREFRONT_WS_MAX_CONTENT_LENGTH",
];

/// Helper to set environment variable for test
fn set_env(key: &str, value: &str) {
    unsafe {
        env::set_var(key, value);
    }
}

fn clear_all_storefront_env_vars() {
    for key in VARS {
        unsafe {
            env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn test_env_config_default_when_no_vars_set() {
    clear_all_storefront_env_vars();

    let config = GatewayConfig::from_env().expect("should load defaults when no env vars set");
    assert_eq!(config, GatewayConfig::default());
}

#[test]
#[serial]
fn test_env_config_pong_wait_drives_ping_interval() {
    clear_all_storefront_env_vars();
    set_env("STOREFRONT_WS_PONG_WAIT_MS", "20000");

    let config = GatewayConfig::from_env().expect("should load config");
    assert_eq!(config.pong_wait, Duration::from_secs(20));
    assert_eq!(config.ping_interval(), Duration::from_secs(18));

    clear_all_storefront_env_vars();
}

#[test]
#[serial]
fn test_env_config_all_vars() {
    clear_all_storefront_env_vars();
    set_env("STOREFRONT_WS_OTP_RETENTION_MS", "30000");
    set_env("STOREFRONT_WS_OTP_SWEEP_MS", "1000");
    set_env("STOREFRONT_WS_MAX_MESSAGE_SIZE", "4096");
    set_env("STOREFRONT_WS_OUTBOUND_BUFFER", "128");
    set_env("STOREFRONT_WS_MAX_CONTENT_LENGTH", "1000");

    let config = GatewayConfig::from_env().expect("should load config");
    assert_eq!(config.otp_retention, Duration::from_secs(30));
    assert_eq!(config.otp_sweep_interval, Duration::from_secs(1));
    assert_eq!(config.max_message_size, 4096);
    assert_eq!(config.outbound_buffer, 128);
    assert_eq!(config.max_content_length, 1000);

    clear_all_storefront_env_vars();
}

#[test]
#[serial]
fn test_env_config_unparsable_value() {
    clear_all_storefront_env_vars();
    set_env("STOREFRONT_WS_MAX_MESSAGE_SIZE", "lots");

    let err = GatewayConfig::from_env().unwrap_err();
    match err {
        ConfigError::InvalidEnvVar { key, message } => {
            assert_eq!(key, "STOREFRONT_WS_MAX_MESSAGE_SIZE");
            assert!(message.contains("lots"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    clear_all_storefront_env_vars();
}

#[test]
#[serial]
fn test_env_config_out_of_range_value_names_the_var() {
    clear_all_storefront_env_vars();
    set_env("STOREFRONT_WS_PONG_WAIT_MS", "100");

    let err = GatewayConfig::from_env().unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InvalidEnvVar { ref key, .. } if key == "STOREFRONT_WS_PONG_WAIT_MS"
    ));

    clear_all_storefront_env_vars();
}
