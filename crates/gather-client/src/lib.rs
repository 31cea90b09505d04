//! # gather-client
//!
//! Conversation and presence engine for the Gather chat widget.
//!
//! - **ConnectionManager**: one real-time link to the chat server, typed
//!   event subscriptions and acknowledged sends
//! - **PresenceTracker**: who is online
//! - **ConversationStore**: per-peer history with unread and last-read state
//! - **ChatSession**: the synchronous controller behind the chat view
//! - **ChatClient**: async driver that wires the above to the network

pub mod backend;
pub mod client;
pub mod config;
pub mod connection;
pub mod conversations;
pub mod directory;
pub mod error;
pub mod events;
pub mod presence;
pub mod session;
pub mod transport;

pub use backend::{BackendApi, HttpBackend};
pub use client::ChatClient;
pub use config::ClientConfig;
pub use connection::{ConnectionManager, Subscription};
pub use conversations::{Conversation, ConversationStore, IncomingOutcome};
pub use directory::UserDirectory;
pub use error::{ClientError, Result};
pub use events::{ConnectionEvent, EventKind};
pub use presence::PresenceTracker;
pub use session::{ChatSession, EchoStatus, HistoryRequest, LocalEcho, Phase};
pub use transport::{Connector, Link, MemoryConnector, MemoryPeer, WsConnector};
