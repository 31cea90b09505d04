//! Per-peer message history and read-state bookkeeping.
//!
//! Conversations are created lazily the first time a peer is referenced and
//! live for the rest of the process. Within a conversation messages are kept
//! in `created_at` order and deduplicated by server id, so a message seen
//! both as a push and in a later history reload is stored once.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use gather_shared::{Message, MessageId, SendAck, UserIdentity};

/// Ordered history and read state for one peer.
#[derive(Debug, Clone)]
pub struct Conversation {
    peer: UserIdentity,
    messages: Vec<Message>,
    unread: usize,
    last_read_at: DateTime<Utc>,
}

impl Conversation {
    fn new(peer: UserIdentity) -> Self {
        Self {
            peer,
            messages: Vec::new(),
            unread: 0,
            last_read_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn peer(&self) -> &UserIdentity {
        &self.peer
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    pub fn last_read_at(&self) -> DateTime<Utc> {
        self.last_read_at
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| m.id.as_ref() == Some(id))
    }

    /// Insert keeping `created_at` order; equal timestamps keep arrival order.
    /// Returns `false` if a message with the same id is already present.
    fn insert_ordered(&mut self, message: Message) -> bool {
        if let Some(id) = &message.id {
            if self.contains(id) {
                return false;
            }
        }
        let pos = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(pos, message);
        true
    }

    fn recount_unread(&mut self) {
        let last_read = self.last_read_at;
        let peer = &self.peer;
        self.unread = self
            .messages
            .iter()
            .filter(|m| &m.sender_id == peer && m.created_at > last_read)
            .count();
    }
}

/// What `record_incoming` did with a pushed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingOutcome {
    /// Stored in the sender's conversation.
    Applied { peer: UserIdentity },
    /// Already present by id.
    Duplicate,
    /// Sent by the local user; those are confirmed through acks instead.
    SelfSent,
    /// Neither sender nor receiver is the local user.
    NotForUs,
}

/// All conversations of the local user, keyed by peer.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    local: UserIdentity,
    active: Option<UserIdentity>,
    conversations: HashMap<UserIdentity, Conversation>,
}

impl ConversationStore {
    pub fn new(local: UserIdentity) -> Self {
        Self {
            local,
            active: None,
            conversations: HashMap::new(),
        }
    }

    pub fn local_user(&self) -> &UserIdentity {
        &self.local
    }

    /// Peer whose conversation is on screen; its incoming messages are not unread.
    pub fn set_active(&mut self, peer: Option<UserIdentity>) {
        self.active = peer;
    }

    pub fn active(&self) -> Option<&UserIdentity> {
        self.active.as_ref()
    }

    /// Create an empty conversation for `peer` if none exists yet.
    pub fn ensure(&mut self, peer: &UserIdentity) -> &mut Conversation {
        self.conversations
            .entry(peer.clone())
            .or_insert_with(|| Conversation::new(peer.clone()))
    }

    /// Replace the local copy of a conversation with the server's history.
    ///
    /// Messages held locally whose id the server did not return arrived after
    /// the response was produced; they are kept. Unread is recomputed against
    /// the conversation's last-read time.
    pub fn load_history(&mut self, peer: &UserIdentity, fetched: Vec<Message>) -> &Conversation {
        let local = self.local.clone();
        let conversation = self.ensure(peer);

        let mut history: Vec<Message> = fetched
            .into_iter()
            .filter(|m| {
                let relevant = (m.sender_id == local && &m.receiver_id == peer)
                    || (&m.sender_id == peer && m.receiver_id == local);
                if !relevant {
                    warn!(peer = %peer, id = ?m.id, "Dropping history entry for another conversation");
                }
                relevant
            })
            .collect();
        history.sort_by_key(|m| m.created_at);

        let fetched_ids: HashSet<MessageId> =
            history.iter().filter_map(|m| m.id.clone()).collect();
        let newer: Vec<Message> = conversation
            .messages
            .drain(..)
            .filter(|m| m.id.as_ref().is_some_and(|id| !fetched_ids.contains(id)))
            .collect();

        for message in history {
            conversation.insert_ordered(message);
        }
        let kept = newer.len();
        for message in newer {
            conversation.insert_ordered(message);
        }
        conversation.recount_unread();

        debug!(
            peer = %peer,
            messages = conversation.messages.len(),
            kept_local = kept,
            unread = conversation.unread,
            "Loaded conversation history"
        );
        conversation
    }

    /// Apply a message pushed by the server.
    pub fn record_incoming(&mut self, message: Message) -> IncomingOutcome {
        if message.sender_id == self.local {
            return IncomingOutcome::SelfSent;
        }
        if message.receiver_id != self.local {
            warn!(sender = %message.sender_id, receiver = %message.receiver_id, "Ignoring message addressed to someone else");
            return IncomingOutcome::NotForUs;
        }

        let peer = message.sender_id.clone();
        let is_active = self.active.as_ref() == Some(&peer);
        let created_at = message.created_at;
        let conversation = self.ensure(&peer);

        if !conversation.insert_ordered(message) {
            return IncomingOutcome::Duplicate;
        }
        if is_active {
            if created_at > conversation.last_read_at {
                conversation.last_read_at = created_at;
            }
        } else {
            conversation.unread += 1;
        }
        IncomingOutcome::Applied { peer }
    }

    /// Finalize a locally echoed send with the id and timestamp from its ack.
    ///
    /// Returns the finalized message and whether it was newly inserted.
    pub fn record_outgoing_confirmed(
        &mut self,
        local_echo: &Message,
        ack: &SendAck,
    ) -> (Message, bool) {
        let confirmed = Message {
            id: Some(ack.id.clone()),
            created_at: ack.created_at,
            ..local_echo.clone()
        };
        let inserted = self
            .ensure(&local_echo.receiver_id)
            .insert_ordered(confirmed.clone());
        (confirmed, inserted)
    }

    pub fn mark_read(&mut self, peer: &UserIdentity) {
        self.mark_read_at(peer, Utc::now());
    }

    pub fn mark_read_at(&mut self, peer: &UserIdentity, at: DateTime<Utc>) {
        let conversation = self.ensure(peer);
        conversation.unread = 0;
        if at > conversation.last_read_at {
            conversation.last_read_at = at;
        }
    }

    pub fn conversation(&self, peer: &UserIdentity) -> Option<&Conversation> {
        self.conversations.get(peer)
    }

    pub fn messages(&self, peer: &UserIdentity) -> &[Message] {
        self.conversations
            .get(peer)
            .map(|c| c.messages())
            .unwrap_or(&[])
    }

    pub fn last_message(&self, peer: &UserIdentity) -> Option<&Message> {
        self.conversations.get(peer).and_then(|c| c.last_message())
    }

    pub fn unread_count(&self, peer: &UserIdentity) -> usize {
        self.conversations.get(peer).map_or(0, |c| c.unread)
    }

    pub fn total_unread(&self) -> usize {
        self.conversations.values().map(|c| c.unread).sum()
    }

    /// Known peers, most recent conversation first.
    pub fn peers(&self) -> Vec<UserIdentity> {
        let mut convs: Vec<&Conversation> = self.conversations.values().collect();
        convs.sort_by(|a, b| {
            let at = |c: &Conversation| c.last_message().map(|m| m.created_at);
            at(b).cmp(&at(a)).then_with(|| a.peer.cmp(&b.peer))
        });
        convs.into_iter().map(|c| c.peer.clone()).collect()
    }
}
