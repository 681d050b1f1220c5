//! Client configuration loaded from environment variables.
//!
//! Every setting has a default suitable for a local backend, so the client
//! starts with zero configuration during development.

use std::time::Duration;

use umi_net::ConnectionConfig;
use umi_shared::constants::{
    DEFAULT_API_URL, DEFAULT_PAGE_SIZE, DEFAULT_WS_URL, HANDSHAKE_TIMEOUT_MS, HEARTBEAT_MS,
    MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_MS, REQUEST_TIMEOUT_SECS,
};

use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST API.
    /// Env: `UMI_API_URL`
    pub api_url: String,

    /// Broker WebSocket endpoint.
    /// Env: `UMI_WS_URL`
    pub ws_url: String,

    /// Bearer token for REST calls and the broker handshake.
    /// Env: `UMI_TOKEN`
    /// Default: none (anonymous).
    pub token: Option<String>,

    /// Env: `UMI_RECONNECT_DELAY_MS`
    pub reconnect_delay: Duration,

    /// Env: `UMI_RECONNECT_ATTEMPTS`
    pub max_reconnect_attempts: u32,

    /// Heart-beat interval offered in both directions, zero disables.
    /// Env: `UMI_HEARTBEAT_MS`
    pub heartbeat: Duration,

    /// Env: `UMI_REQUEST_TIMEOUT_SECS`
    pub request_timeout: Duration,

    /// Messages per history page.
    /// Env: `UMI_PAGE_SIZE`
    pub page_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            token: None,
            reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            heartbeat: Duration::from_millis(HEARTBEAT_MS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("UMI_API_URL") {
            config.api_url = url;
        }

        if let Some(url) = lookup("UMI_WS_URL") {
            config.ws_url = url;
        }

        if let Some(token) = lookup("UMI_TOKEN") {
            if !token.is_empty() {
                config.token = Some(token);
            }
        }

        if let Some(ms) = parse_var::<u64, _>(&lookup, "UMI_RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(ms);
        }

        if let Some(n) = parse_var(&lookup, "UMI_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = n;
        }

        if let Some(ms) = parse_var::<u64, _>(&lookup, "UMI_HEARTBEAT_MS") {
            config.heartbeat = Duration::from_millis(ms);
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "UMI_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Some(size) = parse_var(&lookup, "UMI_PAGE_SIZE") {
            config.page_size = size;
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }

    /// Reject settings the client cannot work with.
    pub fn validate(&self) -> Result<(), ClientError> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ClientError::Config(format!(
                "UMI_API_URL must be an http(s) URL, got {}",
                self.api_url
            )));
        }
        if ws_host(&self.ws_url).is_none() {
            return Err(ClientError::Config(format!(
                "UMI_WS_URL must be a ws(s) URL, got {}",
                self.ws_url
            )));
        }
        if self.page_size == 0 {
            return Err(ClientError::Config("UMI_PAGE_SIZE must be positive".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(ClientError::Config(
                "UMI_REQUEST_TIMEOUT_SECS must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Connection-level subset for the broker connection manager.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: ws_host(&self.ws_url).unwrap_or("localhost").to_string(),
            token: self.token.clone(),
            heartbeat: self.heartbeat,
            reconnect_delay: self.reconnect_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
            handshake_timeout: Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

/// Host part of a `ws://` or `wss://` URL.
fn ws_host(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))?;
    let authority = rest.split('/').next()?;
    let host = authority.rsplit('@').next()?;
    let host = match host.strip_prefix('[') {
        Some(v6) => v6.split(']').next()?,
        None => host.split(':').next()?,
    };
    (!host.is_empty()).then_some(host)
}
