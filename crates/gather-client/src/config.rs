//! Client configuration loaded from environment variables.
//!
//! Everything except the username has a default suitable for a local
//! development backend.

use std::time::Duration;

use gather_shared::constants::{
    CHAT_WS_PATH, DEFAULT_ACK_TIMEOUT_SECS, DEFAULT_EVENT_BUFFER, DEFAULT_HTTP_TIMEOUT_SECS,
    DEFAULT_SERVER_URL, MAX_CONTENT_LEN,
};
use gather_shared::UserIdentity;

use crate::error::{ClientError, Result};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the backend; REST paths and the chat socket hang off it.
    /// Env: `GATHER_SERVER_URL`
    /// Default: `http://localhost:3000`
    pub server_url: String,

    /// The signed-in user. Env: `GATHER_USERNAME`
    pub username: Option<UserIdentity>,

    /// How long to wait for a send acknowledgment.
    /// Env: `GATHER_ACK_TIMEOUT_SECS`
    /// Default: `10`
    pub ack_timeout: Duration,

    /// Timeout applied to every REST request.
    /// Env: `GATHER_HTTP_TIMEOUT_SECS`
    /// Default: `15`
    pub http_timeout: Duration,

    /// Capacity of the connection event channel.
    /// Env: `GATHER_EVENT_BUFFER`
    /// Default: `256`
    pub event_buffer: usize,

    /// Longest accepted message body, in characters.
    pub max_content_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            username: None,
            ack_timeout: Duration::from_secs(DEFAULT_ACK_TIMEOUT_SECS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            event_buffer: DEFAULT_EVENT_BUFFER,
            max_content_len: MAX_CONTENT_LEN,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("GATHER_SERVER_URL") {
            config.server_url = url.trim_end_matches('/').to_string();
        }

        if let Some(name) = lookup("GATHER_USERNAME") {
            match UserIdentity::parse(&name) {
                Ok(id) => config.username = Some(id),
                Err(e) => tracing::warn!(error = %e, "Invalid GATHER_USERNAME, ignoring"),
            }
        }

        if let Some(val) = lookup("GATHER_ACK_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.ack_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid GATHER_ACK_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(val) = lookup("GATHER_HTTP_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.http_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid GATHER_HTTP_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(val) = lookup("GATHER_EVENT_BUFFER") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.event_buffer = n,
                _ => tracing::warn!(value = %val, "Invalid GATHER_EVENT_BUFFER, using default"),
            }
        }

        config
    }

    /// The signed-in user, or a configuration error if none was given.
    pub fn require_username(&self) -> Result<UserIdentity> {
        self.username
            .clone()
            .ok_or_else(|| ClientError::Config("GATHER_USERNAME is not set".into()))
    }

    /// WebSocket URL of the chat namespace, derived from `server_url`.
    pub fn ws_url(&self) -> Result<String> {
        let base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ClientError::Config(format!(
                "server URL must start with http:// or https://, got {}",
                self.server_url
            )));
        };
        Ok(format!("{base}{CHAT_WS_PATH}"))
    }
}
