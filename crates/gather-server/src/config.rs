//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;

use gather_shared::constants::{DEFAULT_HTTP_PORT, MAX_CONTENT_LEN};
use gather_shared::UserIdentity;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:3000`
    pub http_addr: SocketAddr,

    /// Human-readable name for this relay instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Gather Dev Relay"`
    pub instance_name: String,

    /// Users listed by `GET /users` before anyone has joined.
    /// Env: `SEED_USERS` (comma-separated)
    /// Default: empty
    pub seed_users: Vec<UserIdentity>,

    /// Longest accepted message body, in characters.
    /// Env: `MAX_MESSAGE_LEN`
    /// Default: `4096`
    pub max_message_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: "Gather Dev Relay".to_string(),
            seed_users: Vec::new(),
            max_message_len: MAX_CONTENT_LEN,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = get("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(name) = get("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(list) = get("SEED_USERS") {
            config.seed_users = parse_user_list(&list);
        }

        if let Some(val) = get("MAX_MESSAGE_LEN") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_message_len = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_MESSAGE_LEN, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Split a comma-separated list of usernames, skipping blank entries.
fn parse_user_list(list: &str) -> Vec<UserIdentity> {
    let mut users: Vec<UserIdentity> = Vec::new();
    for entry in list.split(',') {
        if let Ok(user) = UserIdentity::parse(entry) {
            if !users.contains(&user) {
                users.push(user);
            }
        }
    }
    users
}
