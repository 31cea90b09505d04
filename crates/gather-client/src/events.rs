use gather_shared::{Message, UserIdentity};

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_PRESENCE_SNAPSHOT: &str = "presenceSnapshot";
pub const EVENT_PEER_ONLINE: &str = "peerOnline";
pub const EVENT_PEER_OFFLINE: &str = "peerOffline";
pub const EVENT_MESSAGE_RECEIVED: &str = "messageReceived";
pub const EVENT_DISCONNECTED: &str = "disconnected";

/// Events published by the connection manager to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The transport is up and the join announcement has been sent.
    Connected,
    PresenceSnapshot(Vec<UserIdentity>),
    PeerOnline(UserIdentity),
    PeerOffline(UserIdentity),
    MessageReceived(Message),
    /// The transport is gone, either on request or because it failed.
    Disconnected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    PresenceSnapshot,
    PeerOnline,
    PeerOffline,
    MessageReceived,
    Disconnected,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Connected,
        EventKind::PresenceSnapshot,
        EventKind::PeerOnline,
        EventKind::PeerOffline,
        EventKind::MessageReceived,
        EventKind::Disconnected,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Connected => EVENT_CONNECTED,
            EventKind::PresenceSnapshot => EVENT_PRESENCE_SNAPSHOT,
            EventKind::PeerOnline => EVENT_PEER_ONLINE,
            EventKind::PeerOffline => EVENT_PEER_OFFLINE,
            EventKind::MessageReceived => EVENT_MESSAGE_RECEIVED,
            EventKind::Disconnected => EVENT_DISCONNECTED,
        }
    }
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Connected => EventKind::Connected,
            ConnectionEvent::PresenceSnapshot(_) => EventKind::PresenceSnapshot,
            ConnectionEvent::PeerOnline(_) => EventKind::PeerOnline,
            ConnectionEvent::PeerOffline(_) => EventKind::PeerOffline,
            ConnectionEvent::MessageReceived(_) => EventKind::MessageReceived,
            ConnectionEvent::Disconnected { .. } => EventKind::Disconnected,
        }
    }
}
