use std::time::Duration;

use serde::Deserialize;

use crate::{
    error::{HttpError, Result},
    pool::MAX_KEEPALIVE_CONNS,
};

const MAX_REDIRECTS: u32 = 100;

pub const DEFAULT_USER_AGENT: &str = concat!("monoio-client/", env!("CARGO_PKG_VERSION"));

/// Client-wide defaults. Timeouts are in milliseconds and `0` disables them
/// (the connect timeout excepted). Requests may override the per-request
/// fields through their builder.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub io_threads: usize,
    pub callback_threads: usize,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub total_request_timeout_ms: u64,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub accept_compressed_response: bool,
    pub keep_alive: bool,
    pub user_agent: String,
    pub request_body_charset: Option<String>,
    pub max_idle_connections_per_key: usize,
    pub idle_connection_ttl_ms: u64,
    pub max_frame_size: usize,
    pub ws_close_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            io_threads: 2,
            callback_threads: 2,
            connect_timeout_ms: 1_000,
            idle_timeout_ms: 0,
            total_request_timeout_ms: 0,
            follow_redirects: true,
            max_redirects: 10,
            accept_compressed_response: true,
            keep_alive: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_body_charset: Some("UTF-8".to_string()),
            max_idle_connections_per_key: 256,
            idle_connection_ttl_ms: 60_000,
            max_frame_size: 16 * 1024 * 1024,
            ws_close_timeout_ms: 5_000,
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| HttpError::Configuration(format!("invalid client config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.io_threads == 0 {
            return Err(HttpError::Configuration("io_threads must be > 0".into()));
        }
        if self.callback_threads == 0 {
            return Err(HttpError::Configuration(
                "callback_threads must be > 0".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(HttpError::Configuration(
                "connect_timeout_ms must be > 0".into(),
            ));
        }
        if self.max_redirects > MAX_REDIRECTS {
            return Err(HttpError::Configuration(format!(
                "max_redirects exceeds {MAX_REDIRECTS}"
            )));
        }
        if self.user_agent.trim().is_empty() {
            return Err(HttpError::Configuration("user_agent is empty".into()));
        }
        if self.max_idle_connections_per_key > MAX_KEEPALIVE_CONNS {
            return Err(HttpError::Configuration(format!(
                "max_idle_connections_per_key exceeds {MAX_KEEPALIVE_CONNS}"
            )));
        }
        if self.max_frame_size < 125 {
            return Err(HttpError::Configuration(
                "max_frame_size must fit a control frame".into(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn idle_timeout(&self) -> Option<Duration> {
        millis(self.idle_timeout_ms)
    }

    #[inline]
    pub fn total_request_timeout(&self) -> Option<Duration> {
        millis(self.total_request_timeout_ms)
    }

    #[inline]
    pub fn idle_connection_ttl(&self) -> Option<Duration> {
        millis(self.idle_connection_ttl_ms)
    }

    #[inline]
    pub fn ws_close_timeout(&self) -> Duration {
        Duration::from_millis(self.ws_close_timeout_ms.max(1))
    }
}
