//! Chat session controller.
//!
//! `ChatSession` holds everything the chat view shows: connection phase,
//! presence, the directory, every conversation, the transcript of the
//! selected peer and optimistic sends still waiting for their ack. It does
//! no I/O. Operations that need the network are split in two: a `begin`
//! step validates and returns what to request, and an `apply` step takes
//! the response. [`crate::client::ChatClient`] drives both halves.

use chrono::Utc;
use tracing::{debug, info, warn};

use gather_shared::protocol::normalize_content;
use gather_shared::{Message, SendAck, UserIdentity, UserProfile, ValidationError};

use crate::conversations::{ConversationStore, IncomingOutcome};
use crate::directory::UserDirectory;
use crate::error::{ClientError, Result};
use crate::events::ConnectionEvent;
use crate::presence::PresenceTracker;

/// Connection lifecycle as seen by the chat view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

/// A history fetch the driver has to perform for `peer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub peer: UserIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoStatus {
    Pending,
    Failed,
}

/// An optimistic send shown to the user until the server acknowledges it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEcho {
    pub local_id: u64,
    /// The message as sent; `id` stays `None` until the ack arrives.
    pub message: Message,
    pub status: EchoStatus,
}

pub struct ChatSession {
    phase: Phase,
    store: ConversationStore,
    presence: PresenceTracker,
    directory: UserDirectory,
    transcript: Vec<Message>,
    pending: Vec<LocalEcho>,
    next_local_id: u64,
    max_content_len: usize,
    /// Set when pushes may have been missed; cleared by [`Self::take_resync`].
    needs_resync: bool,
}

impl ChatSession {
    pub fn new(local: UserIdentity, max_content_len: usize) -> Self {
        Self {
            phase: Phase::Disconnected,
            store: ConversationStore::new(local),
            presence: PresenceTracker::new(),
            directory: UserDirectory::new(),
            transcript: Vec::new(),
            pending: Vec::new(),
            next_local_id: 0,
            max_content_len,
            needs_resync: false,
        }
    }

    pub fn local_user(&self) -> &UserIdentity {
        self.store.local_user()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    /// Enter `Connecting`; returns the identity to announce.
    pub fn begin_connect(&mut self) -> UserIdentity {
        self.phase = Phase::Connecting;
        self.local_user().clone()
    }

    /// Apply one event from the connection manager.
    pub fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.phase = Phase::Connected;
            }
            // Presence from a link that is already gone is stale.
            ConnectionEvent::PresenceSnapshot(_)
            | ConnectionEvent::PeerOnline(_)
            | ConnectionEvent::PeerOffline(_)
                if self.phase == Phase::Disconnected => {}
            ConnectionEvent::PresenceSnapshot(identities) => {
                self.presence.apply_snapshot(identities);
            }
            ConnectionEvent::PeerOnline(identity) => self.presence.on_online(identity),
            ConnectionEvent::PeerOffline(identity) => self.presence.on_offline(&identity),
            ConnectionEvent::MessageReceived(message) => self.on_message(message),
            ConnectionEvent::Disconnected { reason } => self.on_disconnected(&reason),
        }
    }

    fn on_message(&mut self, message: Message) {
        match self.store.record_incoming(message.clone()) {
            IncomingOutcome::Applied { peer } => {
                if self.store.active() == Some(&peer) {
                    insert_visible(&mut self.transcript, message);
                } else {
                    debug!(
                        peer = %peer,
                        unread = self.store.unread_count(&peer),
                        "Message for background conversation"
                    );
                }
            }
            IncomingOutcome::Duplicate | IncomingOutcome::SelfSent | IncomingOutcome::NotForUs => {}
        }
    }

    fn on_disconnected(&mut self, reason: &str) {
        if self.phase != Phase::Disconnected {
            info!(reason, "Chat session disconnected");
        }
        if self.phase == Phase::Connected {
            self.needs_resync = true;
        }
        self.phase = Phase::Disconnected;
        self.presence.clear();
        self.store.set_active(None);
        self.transcript.clear();
        for echo in &mut self.pending {
            echo.status = EchoStatus::Failed;
        }
    }

    /// The event stream dropped events, so unread counts and presence can no
    /// longer be trusted. Behaves like a disconnect and flags a full
    /// resync for the next connect.
    pub fn mark_out_of_sync(&mut self, reason: &str) {
        warn!(reason, "Chat session out of sync");
        self.on_disconnected(reason);
        self.needs_resync = true;
    }

    /// Whether a history resync is due; clears the flag.
    pub fn take_resync(&mut self) -> bool {
        std::mem::take(&mut self.needs_resync)
    }

    /// One history request per known conversation.
    pub fn resync_requests(&self) -> Vec<HistoryRequest> {
        self.store
            .peers()
            .into_iter()
            .map(|peer| HistoryRequest { peer })
            .collect()
    }

    /// Open the conversation with `peer`.
    ///
    /// The transcript starts from whatever is cached locally; the returned
    /// request fetches the authoritative history. Re-selecting the current
    /// peer only asks for a new fetch.
    pub fn select_peer(&mut self, peer: UserIdentity) -> Result<HistoryRequest> {
        if self.phase != Phase::Connected {
            return Err(ClientError::NotConnected);
        }
        if &peer == self.local_user() {
            return Err(ValidationError::SelfAddressed.into());
        }

        if self.store.active() != Some(&peer) {
            self.store.set_active(Some(peer.clone()));
            self.store.mark_read(&peer);
            self.transcript = self.store.messages(&peer).to_vec();
            debug!(peer = %peer, cached = self.transcript.len(), "Selected peer");
        }
        Ok(HistoryRequest { peer })
    }

    /// Store a history response in its peer's slot.
    ///
    /// Only refreshes the transcript if that peer is still the selected one,
    /// so a slow response for an earlier selection never overwrites the
    /// current view.
    pub fn apply_history(&mut self, request: HistoryRequest, messages: Vec<Message>) {
        let peer = request.peer;
        self.store.load_history(&peer, messages);

        if self.store.active() == Some(&peer) {
            self.store.mark_read(&peer);
            self.transcript = self.store.messages(&peer).to_vec();
        } else {
            debug!(peer = %peer, "History for unselected peer stored in background");
        }
    }

    /// Replace the user directory. Returns one history request per listed
    /// user so previews and unread badges can be filled in.
    pub fn apply_directory(&mut self, profiles: Vec<UserProfile>) -> Vec<HistoryRequest> {
        let local = self.local_user().clone();
        self.directory.replace(&local, profiles);

        let peers: Vec<UserIdentity> = self
            .directory
            .users()
            .iter()
            .map(|u| u.username.clone())
            .collect();
        peers
            .into_iter()
            .map(|peer| {
                self.store.ensure(&peer);
                HistoryRequest { peer }
            })
            .collect()
    }

    /// Validate `text` and create an optimistic echo for the selected peer.
    pub fn begin_send(&mut self, text: &str) -> Result<LocalEcho> {
        if self.phase != Phase::Connected {
            return Err(ClientError::NotConnected);
        }
        let peer = self
            .store
            .active()
            .cloned()
            .ok_or(ClientError::NoPeerSelected)?;
        let content = normalize_content(text, self.max_content_len)?;

        self.next_local_id += 1;
        let echo = LocalEcho {
            local_id: self.next_local_id,
            message: Message {
                id: None,
                sender_id: self.local_user().clone(),
                receiver_id: peer,
                content,
                created_at: Utc::now(),
            },
            status: EchoStatus::Pending,
        };
        self.pending.push(echo.clone());
        Ok(echo)
    }

    /// Finalize a send with the server's id and timestamp.
    ///
    /// Acks may come back in any order; the confirmed message lands at its
    /// `created_at` position.
    pub fn confirm_send(&mut self, echo: &LocalEcho, ack: &SendAck) -> Message {
        self.pending.retain(|p| p.local_id != echo.local_id);

        let (confirmed, _) = self.store.record_outgoing_confirmed(&echo.message, ack);
        if self.store.active() == Some(confirmed.peer_of(self.store.local_user())) {
            insert_visible(&mut self.transcript, confirmed.clone());
        }
        debug!(id = %ack.id, receiver = %confirmed.receiver_id, "Send confirmed");
        confirmed
    }

    /// Mark a send as failed. Failed sends are not retried.
    pub fn fail_send(&mut self, local_id: u64) {
        match self.pending.iter_mut().find(|p| p.local_id == local_id) {
            Some(echo) => echo.status = EchoStatus::Failed,
            None => warn!(local_id, "Failure for unknown send"),
        }
    }

    /// Forget sends that have failed.
    pub fn clear_failed(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|p| p.status != EchoStatus::Failed);
        before - self.pending.len()
    }

    pub fn selected_peer(&self) -> Option<&UserIdentity> {
        self.store.active()
    }

    /// Messages of the selected conversation in `created_at` order.
    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn pending_sends(&self) -> &[LocalEcho] {
        &self.pending
    }

    /// Unconfirmed or failed sends addressed to `peer`.
    pub fn pending_for<'a>(
        &'a self,
        peer: &'a UserIdentity,
    ) -> impl Iterator<Item = &'a LocalEcho> {
        self.pending
            .iter()
            .filter(move |echo| &echo.message.receiver_id == peer)
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.store
    }

    pub fn unread_count(&self, peer: &UserIdentity) -> usize {
        self.store.unread_count(peer)
    }

    pub fn total_unread(&self) -> usize {
        self.store.total_unread()
    }

    pub fn last_message(&self, peer: &UserIdentity) -> Option<&Message> {
        self.store.last_message(peer)
    }

    pub fn is_online(&self, peer: &UserIdentity) -> bool {
        self.presence.is_online(peer)
    }

    pub fn online(&self) -> Vec<UserIdentity> {
        self.presence.online()
    }

    pub fn directory(&self) -> &UserDirectory {
        &self.directory
    }
}

fn insert_visible(transcript: &mut Vec<Message>, message: Message) {
    if let Some(id) = &message.id {
        if transcript.iter().any(|m| m.id.as_ref() == Some(id)) {
            return;
        }
    }
    let pos = transcript.partition_point(|m| m.created_at <= message.created_at);
    transcript.insert(pos, message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use gather_shared::MessageId;

    fn user(name: &str) -> UserIdentity {
        UserIdentity::parse(name).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, from: &str, to: &str, content: &str, secs: i64) -> Message {
        Message {
            id: Some(MessageId::from(id)),
            sender_id: user(from),
            receiver_id: user(to),
            content: content.into(),
            created_at: at(secs),
        }
    }

    fn ack(id: &str, secs: i64) -> SendAck {
        SendAck {
            id: MessageId::from(id),
            created_at: at(secs),
        }
    }

    fn connected() -> ChatSession {
        let mut session = ChatSession::new(user("u1"), 4096);
        assert_eq!(session.begin_connect(), user("u1"));
        assert_eq!(session.phase(), Phase::Connecting);
        session.handle_event(ConnectionEvent::Connected);
        assert_eq!(session.phase(), Phase::Connected);
        session
    }

    fn contents(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn test_select_requires_connection() {
        let mut session = ChatSession::new(user("u1"), 4096);
        assert!(matches!(
            session.select_peer(user("u2")),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn test_cannot_select_self() {
        let mut session = connected();
        assert!(matches!(
            session.select_peer(user("u1")),
            Err(ClientError::Validation(ValidationError::SelfAddressed))
        ));
    }

    #[test]
    fn test_reading_twice_keeps_unread_at_zero() {
        let mut session = connected();
        session.handle_event(ConnectionEvent::MessageReceived(msg("m1", "u2", "u1", "a", 1)));

        let req = session.select_peer(user("u2")).unwrap();
        session.apply_history(req, vec![msg("m1", "u2", "u1", "a", 1)]);
        assert_eq!(session.unread_count(&user("u2")), 0);

        let req = session.select_peer(user("u2")).unwrap();
        session.apply_history(req, vec![msg("m1", "u2", "u1", "a", 1)]);
        assert_eq!(session.unread_count(&user("u2")), 0);
    }

    #[test]
    fn test_push_then_history_stores_once() {
        let mut session = connected();
        let req = session.select_peer(user("u2")).unwrap();
        session.handle_event(ConnectionEvent::MessageReceived(msg("m1", "u2", "u1", "x", 1)));
        session.handle_event(ConnectionEvent::MessageReceived(msg("m1", "u2", "u1", "x", 1)));
        session.apply_history(req, vec![msg("m1", "u2", "u1", "x", 1)]);

        assert_eq!(session.transcript().len(), 1);
        assert_eq!(session.conversations().messages(&user("u2")).len(), 1);
    }

    #[test]
    fn test_unread_accumulates_until_selected() {
        let mut session = connected();
        for (i, id) in ["m1", "m2", "m3"].iter().enumerate() {
            session.handle_event(ConnectionEvent::MessageReceived(msg(
                id,
                "u2",
                "u1",
                "x",
                i as i64,
            )));
        }
        assert_eq!(session.unread_count(&user("u2")), 3);

        session.select_peer(user("u2")).unwrap();
        assert_eq!(session.unread_count(&user("u2")), 0);
        assert_eq!(session.transcript().len(), 3);
    }

    #[test]
    fn test_self_sent_push_not_applied() {
        let mut session = connected();
        session.handle_event(ConnectionEvent::MessageReceived(msg("m1", "u1", "u2", "mine", 1)));
        assert_eq!(session.total_unread(), 0);
        assert!(session.last_message(&user("u2")).is_none());
    }

    #[test]
    fn test_presence_snapshot_is_authoritative() {
        let mut session = connected();
        session.handle_event(ConnectionEvent::PeerOnline(user("a")));
        session.handle_event(ConnectionEvent::PresenceSnapshot(vec![user("b")]));
        assert!(!session.is_online(&user("a")));
        assert!(session.is_online(&user("b")));

        session.handle_event(ConnectionEvent::PeerOffline(user("b")));
        assert!(session.online().is_empty());
    }

    #[test]
    fn test_stale_history_does_not_touch_current_transcript() {
        let mut session = connected();
        let req_a = session.select_peer(user("a")).unwrap();
        let req_b = session.select_peer(user("b")).unwrap();

        session.apply_history(req_b, vec![msg("b1", "b", "u1", "from b", 2)]);
        session.apply_history(req_a, vec![msg("a1", "a", "u1", "from a", 1)]);

        assert_eq!(session.selected_peer(), Some(&user("b")));
        assert_eq!(contents(session.transcript()), vec!["from b"]);
        // A's response still lands in A's slot, already read when A was open.
        assert_eq!(session.last_message(&user("a")).unwrap().content, "from a");
        assert_eq!(session.unread_count(&user("a")), 0);
    }

    #[test]
    fn test_send_confirmed_by_ack() {
        let mut session = connected();
        let req = session.select_peer(user("u2")).unwrap();
        session.apply_history(req, Vec::new());

        let echo = session.begin_send("hello").unwrap();
        assert_eq!(echo.message.id, None);
        assert_eq!(session.pending_sends().len(), 1);

        let confirmed = session.confirm_send(&echo, &ack("m1", 10));
        assert_eq!(confirmed.id, Some(MessageId::from("m1")));

        // The server also pushes the message back to the sender.
        session.handle_event(ConnectionEvent::MessageReceived(confirmed.clone()));

        assert_eq!(session.transcript(), &[confirmed]);
        assert_eq!(session.transcript()[0].content, "hello");
        assert_eq!(session.transcript()[0].created_at, at(10));
        assert_eq!(session.unread_count(&user("u2")), 0);
        assert!(session.pending_sends().is_empty());
    }

    #[test]
    fn test_self_sent_push_before_ack_stored_once() {
        let mut session = connected();
        session.select_peer(user("u2")).unwrap();
        let echo = session.begin_send("hello").unwrap();

        // The relay's push to our own socket overtakes the ack.
        let pushed = msg("m1", "u1", "u2", "hello", 10);
        session.handle_event(ConnectionEvent::MessageReceived(pushed.clone()));
        assert!(session.transcript().is_empty());
        assert_eq!(session.pending_sends().len(), 1);

        let confirmed = session.confirm_send(&echo, &ack("m1", 10));
        assert_eq!(confirmed, pushed);
        assert_eq!(session.transcript(), &[pushed]);
        assert_eq!(session.conversations().messages(&user("u2")).len(), 1);
        assert_eq!(session.unread_count(&user("u2")), 0);
        assert!(session.pending_sends().is_empty());
    }

    #[test]
    fn test_pending_sends_are_listed_per_peer() {
        let mut session = connected();
        session.select_peer(user("u2")).unwrap();
        let to_u2 = session.begin_send("for u2").unwrap();
        session.fail_send(to_u2.local_id);
        session.select_peer(user("u3")).unwrap();
        session.begin_send("for u3").unwrap();

        let u3 = user("u3");
        let for_u3: Vec<&str> = session
            .pending_for(&u3)
            .map(|e| e.message.content.as_str())
            .collect();
        assert_eq!(for_u3, vec!["for u3"]);
        assert_eq!(session.pending_for(&user("u2")).count(), 1);

        assert_eq!(session.clear_failed(), 1);
        assert_eq!(session.pending_for(&user("u2")).count(), 0);
        assert_eq!(session.pending_for(&user("u3")).count(), 1);
    }

    #[test]
    fn test_out_of_sync_disconnects_and_requests_resync() {
        let mut session = connected();
        session.handle_event(ConnectionEvent::PresenceSnapshot(vec![user("u2")]));
        session.handle_event(ConnectionEvent::MessageReceived(msg("m1", "u2", "u1", "a", 1)));
        session.select_peer(user("u3")).unwrap();

        session.mark_out_of_sync("event stream lagged");
        assert_eq!(session.phase(), Phase::Disconnected);
        assert_eq!(session.selected_peer(), None);
        assert!(session.online().is_empty());

        // Presence still queued from the dead link is not applied.
        session.handle_event(ConnectionEvent::PeerOnline(user("u4")));
        assert!(session.online().is_empty());

        let peers: Vec<UserIdentity> = session
            .resync_requests()
            .into_iter()
            .map(|r| r.peer)
            .collect();
        assert!(peers.contains(&user("u2")));
        assert!(peers.contains(&user("u3")));
        assert!(session.take_resync());
        assert!(!session.take_resync());
    }

    #[test]
    fn test_dropped_connection_requests_resync() {
        let mut session = ChatSession::new(user("u1"), 4096);
        session.begin_connect();
        session.handle_event(ConnectionEvent::Disconnected {
            reason: "refused".into(),
        });
        // Never connected, nothing could have been missed.
        assert!(!session.take_resync());

        let mut session = connected();
        session.handle_event(ConnectionEvent::Disconnected {
            reason: "server closed the connection".into(),
        });
        assert!(session.take_resync());
    }

    #[test]
    fn test_receive_for_unselected_peer() {
        let mut session = connected();
        session.select_peer(user("u3")).unwrap();
        session.handle_event(ConnectionEvent::MessageReceived(msg("m2", "u2", "u1", "hi", 1)));

        assert_eq!(session.unread_count(&user("u2")), 1);
        assert_eq!(session.last_message(&user("u2")).unwrap().content, "hi");
        assert!(session.transcript().is_empty());
    }

    #[test]
    fn test_acks_out_of_order_keep_transcript_ordered() {
        let mut session = connected();
        session.select_peer(user("u2")).unwrap();

        let first = session.begin_send("first").unwrap();
        let second = session.begin_send("second").unwrap();
        session.confirm_send(&second, &ack("m2", 20));
        session.confirm_send(&first, &ack("m1", 10));

        assert_eq!(contents(session.transcript()), vec!["first", "second"]);
    }

    #[test]
    fn test_send_rejects_blank_or_unselected() {
        let mut session = connected();
        assert!(matches!(
            session.begin_send("hello"),
            Err(ClientError::NoPeerSelected)
        ));

        session.select_peer(user("u2")).unwrap();
        assert!(matches!(
            session.begin_send("   "),
            Err(ClientError::Validation(ValidationError::EmptyContent))
        ));
        assert!(session.pending_sends().is_empty());

        let echo = session.begin_send("  padded  ").unwrap();
        assert_eq!(echo.message.content, "padded");
    }

    #[test]
    fn test_disconnect_fails_pending_and_releases_selection() {
        let mut session = connected();
        session.select_peer(user("u2")).unwrap();
        session.handle_event(ConnectionEvent::PresenceSnapshot(vec![user("u2")]));
        let echo = session.begin_send("lost").unwrap();

        session.handle_event(ConnectionEvent::Disconnected {
            reason: "server closed the connection".into(),
        });

        assert_eq!(session.phase(), Phase::Disconnected);
        assert_eq!(session.selected_peer(), None);
        assert!(!session.is_online(&user("u2")));
        assert_eq!(session.pending_sends()[0].local_id, echo.local_id);
        assert_eq!(session.pending_sends()[0].status, EchoStatus::Failed);
        assert!(matches!(
            session.begin_send("again"),
            Err(ClientError::NotConnected)
        ));

        assert_eq!(session.clear_failed(), 1);
        assert!(session.pending_sends().is_empty());
    }

    #[test]
    fn test_fail_send_marks_echo() {
        let mut session = connected();
        session.select_peer(user("u2")).unwrap();
        let echo = session.begin_send("nope").unwrap();
        session.fail_send(echo.local_id);
        assert_eq!(session.pending_sends()[0].status, EchoStatus::Failed);
        assert!(session.transcript().is_empty());
    }

    #[test]
    fn test_directory_creates_conversations() {
        let mut session = ChatSession::new(user("u1"), 4096);
        let requests = session.apply_directory(vec![
            UserProfile::new(user("u1")),
            UserProfile::new(user("alice")),
            UserProfile::new(user("bob")),
        ]);

        let peers: Vec<&str> = requests.iter().map(|r| r.peer.as_str()).collect();
        assert_eq!(peers, vec!["alice", "bob"]);
        assert!(session.conversations().conversation(&user("alice")).is_some());

        for req in requests {
            let peer = req.peer.as_str().to_string();
            session.apply_history(req, vec![msg("x", &peer, "u1", "preview", 1)]);
        }
        assert_eq!(session.last_message(&user("bob")).unwrap().content, "preview");
        assert_eq!(session.total_unread(), 2);
    }
}
