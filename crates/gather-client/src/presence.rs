//! Online-status tracking.
//!
//! The server sends a full snapshot of online users after `join` and then
//! incremental online/offline updates. A snapshot always replaces whatever
//! the tracker held before.

use std::collections::HashSet;

use tracing::debug;

use gather_shared::UserIdentity;

/// Set of user identities currently online.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    online: HashSet<UserIdentity>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set with an authoritative snapshot.
    pub fn apply_snapshot(&mut self, identities: impl IntoIterator<Item = UserIdentity>) {
        self.online = identities.into_iter().collect();
        debug!(online = self.online.len(), "Applied presence snapshot");
    }

    pub fn on_online(&mut self, identity: UserIdentity) {
        if self.online.insert(identity.clone()) {
            debug!(user = %identity, "User came online");
        }
    }

    pub fn on_offline(&mut self, identity: &UserIdentity) {
        if self.online.remove(identity) {
            debug!(user = %identity, "User went offline");
        }
    }

    pub fn is_online(&self, identity: &UserIdentity) -> bool {
        self.online.contains(identity)
    }

    /// Online users in name order.
    pub fn online(&self) -> Vec<UserIdentity> {
        let mut users: Vec<UserIdentity> = self.online.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Forget everything; used when the connection goes away.
    pub fn clear(&mut self) {
        self.online.clear();
    }
}
