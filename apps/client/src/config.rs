use std::time::Duration;

use anyhow::{Context, Result};

use crate::login::LoginFlowConfig;
use crate::realtime::ReconnectPolicy;

/// Client configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub ws_url: String,
    pub api_base_url: String,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub qr_poll_interval_ms: u64,
    pub qr_settle_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub qr_output_path: String,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            ws_url: require_env("SYNC_WS_URL")?,
            api_base_url: require_env("API_BASE_URL")?,
            reconnect_interval_ms: parse_env("RECONNECT_INTERVAL_MS", 3000)?,
            max_reconnect_attempts: parse_env("MAX_RECONNECT_ATTEMPTS", 5)?,
            qr_poll_interval_ms: parse_env("QR_POLL_INTERVAL_MS", 2000)?,
            qr_settle_delay_ms: parse_env("QR_SETTLE_DELAY_MS", 2000)?,
            request_timeout_secs: parse_env("REQUEST_TIMEOUT_SECS", 30)?,
            qr_output_path: std::env::var("QR_OUTPUT_PATH")
                .unwrap_or_else(|_| "boss-login-qrcode.png".to_string()),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            interval: Duration::from_millis(self.reconnect_interval_ms),
        }
    }

    pub fn login_flow_config(&self) -> LoginFlowConfig {
        LoginFlowConfig {
            poll_interval: Duration::from_millis(self.qr_poll_interval_ms),
            settle_delay: Duration::from_millis(self.qr_settle_delay_ms),
            ..LoginFlowConfig::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{key} must be a valid number, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            ws_url: "ws://localhost:8080/ws".to_string(),
            api_base_url: "http://localhost:8080/api/boss/login".to_string(),
            reconnect_interval_ms: 1500,
            max_reconnect_attempts: 7,
            qr_poll_interval_ms: 1000,
            qr_settle_delay_ms: 500,
            request_timeout_secs: 10,
            qr_output_path: "qr.png".to_string(),
            rust_log: "debug".to_string(),
        }
    }

    #[test]
    fn test_reconnect_policy_reflects_config() {
        let policy = sample().reconnect_policy();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.interval, Duration::from_millis(1500));
    }

    #[test]
    fn test_login_flow_config_keeps_default_backoff() {
        let cfg = sample().login_flow_config();
        assert_eq!(cfg.poll_interval, Duration::from_millis(1000));
        assert_eq!(cfg.settle_delay, Duration::from_millis(500));
        assert_eq!(cfg.backoff.max_attempts, 4);
    }

    #[test]
    fn test_parse_env_uses_default_when_unset() {
        let value: u64 = parse_env("DELIVERY_SYNC_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
