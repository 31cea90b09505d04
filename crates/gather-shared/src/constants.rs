/// Application name
pub const APP_NAME: &str = "Gather";

/// Default backend base URL (REST + WebSocket)
pub const DEFAULT_SERVER_URL: &str = "http://localhost:3000";

/// WebSocket path of the chat namespace
pub const CHAT_WS_PATH: &str = "/chat/ws";

/// REST path prefix for conversation history: `/chat/messages/{a}/{b}`
pub const HISTORY_PATH: &str = "/chat/messages";

/// REST path of the user listing
pub const USERS_PATH: &str = "/users";

/// Maximum size of a single wire frame in bytes (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Maximum message content length in characters
pub const MAX_CONTENT_LEN: usize = 4096;

/// Seconds to wait for a send acknowledgment before treating the link as dead
pub const DEFAULT_ACK_TIMEOUT_SECS: u64 = 10;

/// Seconds before an HTTP request to the backend is abandoned
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;

/// Capacity of the connection event fan-out channel
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 3000;
