//! In-memory chat relay state: live sockets, presence, and message history.
//!
//! Each WebSocket registers an outbound queue with the hub. Frames are
//! delivered with `try_send`; a socket that cannot keep up loses frames
//! rather than stalling everyone else.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use gather_shared::protocol::normalize_content;
use gather_shared::{Message, MessageId, ServerFrame, UserIdentity, UserProfile, ValidationError};

use crate::error::ServerError;

pub type SocketId = u64;

struct Socket {
    identity: Option<UserIdentity>,
    tx: mpsc::Sender<ServerFrame>,
}

#[derive(Default)]
struct HubState {
    sockets: HashMap<SocketId, Socket>,
    next_socket: SocketId,
    known_users: BTreeSet<UserIdentity>,
    history: Vec<Message>,
}

impl HubState {
    fn is_online(&self, identity: &UserIdentity) -> bool {
        self.sockets
            .values()
            .any(|s| s.identity.as_ref() == Some(identity))
    }

    fn online(&self) -> Vec<UserIdentity> {
        let online: BTreeSet<&UserIdentity> = self
            .sockets
            .values()
            .filter_map(|s| s.identity.as_ref())
            .collect();
        online.into_iter().cloned().collect()
    }

    fn deliver(&self, id: SocketId, frame: ServerFrame) {
        if let Some(socket) = self.sockets.get(&id) {
            if socket.tx.try_send(frame).is_err() {
                debug!(socket = id, "Dropping frame for slow or closed socket");
            }
        }
    }

    /// Send `frame` to every joined socket except those of `except`.
    fn broadcast_except(&self, except: &UserIdentity, frame: &ServerFrame) {
        for (id, socket) in &self.sockets {
            match &socket.identity {
                Some(identity) if identity != except => self.deliver(*id, frame.clone()),
                _ => {}
            }
        }
    }

    /// Detach `id` from its identity; announces the identity offline if
    /// that was its last socket.
    fn unbind(&mut self, id: SocketId) {
        let Some(previous) = self.sockets.get_mut(&id).and_then(|s| s.identity.take()) else {
            return;
        };
        if !self.is_online(&previous) {
            info!(user = %previous, "User offline");
            self.broadcast_except(
                &previous,
                &ServerFrame::PeerOffline {
                    identity: previous.clone(),
                },
            );
        }
    }
}

pub struct ChatHub {
    state: RwLock<HubState>,
    max_message_len: usize,
}

impl ChatHub {
    pub fn new(seed_users: impl IntoIterator<Item = UserIdentity>, max_message_len: usize) -> Self {
        let state = HubState {
            known_users: seed_users.into_iter().collect(),
            ..HubState::default()
        };
        Self {
            state: RwLock::new(state),
            max_message_len,
        }
    }

    /// Register a new socket's outbound queue. It is not bound to a user
    /// until it sends `join`.
    pub async fn register(&self, tx: mpsc::Sender<ServerFrame>) -> SocketId {
        let mut state = self.state.write().await;
        state.next_socket += 1;
        let id = state.next_socket;
        state.sockets.insert(id, Socket { identity: None, tx });
        debug!(socket = id, "Socket registered");
        id
    }

    /// Bind `id` to `identity`, send it the presence snapshot, and announce
    /// the identity to everyone else if it was not online yet.
    pub async fn join(&self, id: SocketId, identity: UserIdentity) {
        let mut state = self.state.write().await;
        if !state.sockets.contains_key(&id) {
            return;
        }
        if state.sockets.get(&id).and_then(|s| s.identity.as_ref()) == Some(&identity) {
            let snapshot = ServerFrame::PresenceSnapshot {
                identities: state.online(),
            };
            state.deliver(id, snapshot);
            return;
        }

        state.unbind(id);
        let first_socket = !state.is_online(&identity);
        if let Some(socket) = state.sockets.get_mut(&id) {
            socket.identity = Some(identity.clone());
        }
        state.known_users.insert(identity.clone());

        let snapshot = ServerFrame::PresenceSnapshot {
            identities: state.online(),
        };
        state.deliver(id, snapshot);

        if first_socket {
            info!(user = %identity, socket = id, "User online");
            state.broadcast_except(
                &identity,
                &ServerFrame::PeerOnline {
                    identity: identity.clone(),
                },
            );
        }
    }

    /// Validate and store a message, ack it to the sending socket, then push
    /// it to every socket of both participants. The caller answers errors
    /// with a `nack`.
    pub async fn send_message(
        &self,
        id: SocketId,
        correlation_id: u64,
        sender_id: UserIdentity,
        receiver_id: UserIdentity,
        content: &str,
    ) -> Result<Message, ServerError> {
        let mut state = self.state.write().await;

        let joined = state
            .sockets
            .get(&id)
            .and_then(|s| s.identity.clone())
            .ok_or(ServerError::NotJoined)?;
        if joined != sender_id {
            return Err(ServerError::SenderMismatch {
                claimed: sender_id.to_string(),
                joined: joined.to_string(),
            });
        }
        if receiver_id == sender_id {
            return Err(ValidationError::SelfAddressed.into());
        }
        let content = normalize_content(content, self.max_message_len)?;

        let message_id = MessageId::new_v4();
        let message = Message {
            id: Some(message_id.clone()),
            sender_id,
            receiver_id,
            content,
            created_at: Utc::now(),
        };
        state.history.push(message.clone());

        state.deliver(
            id,
            ServerFrame::Ack {
                correlation_id,
                id: message_id,
                created_at: message.created_at,
            },
        );

        let targets: Vec<SocketId> = state
            .sockets
            .iter()
            .filter(|(_, s)| {
                s.identity.as_ref() == Some(&message.sender_id)
                    || s.identity.as_ref() == Some(&message.receiver_id)
            })
            .map(|(id, _)| *id)
            .collect();
        for target in targets {
            state.deliver(
                target,
                ServerFrame::MessageReceived {
                    message: message.clone(),
                },
            );
        }

        debug!(
            id = ?message.id,
            sender = %message.sender_id,
            receiver = %message.receiver_id,
            "Message relayed"
        );
        Ok(message)
    }

    /// Remove a closed socket.
    pub async fn leave(&self, id: SocketId) {
        let mut state = self.state.write().await;
        state.unbind(id);
        state.sockets.remove(&id);
        debug!(socket = id, "Socket removed");
    }

    /// Messages between `a` and `b`, oldest first.
    pub async fn history_between(&self, a: &UserIdentity, b: &UserIdentity) -> Vec<Message> {
        let state = self.state.read().await;
        let mut messages: Vec<Message> = state
            .history
            .iter()
            .filter(|m| {
                (&m.sender_id == a && &m.receiver_id == b)
                    || (&m.sender_id == b && &m.receiver_id == a)
            })
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        messages
    }

    pub async fn users(&self) -> Vec<UserProfile> {
        let state = self.state.read().await;
        state
            .known_users
            .iter()
            .cloned()
            .map(UserProfile::new)
            .collect()
    }

    pub async fn online(&self) -> Vec<UserIdentity> {
        self.state.read().await.online()
    }
}
