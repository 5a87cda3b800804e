//! User presence tracking

use std::collections::BTreeSet;

use crate::UserId;

/// Who is connected to a document, and who has changed it
#[derive(Debug, Clone, Default)]
pub struct Presence {
    /// Users on the presence feed
    online: BTreeSet<UserId>,
    /// Authors seen on the change feed, first-seen order
    contributors: Vec<UserId>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the online set. Returns whether it changed.
    pub fn set_online(&mut self, users: impl IntoIterator<Item = UserId>) -> bool {
        let online: BTreeSet<UserId> = users.into_iter().collect();
        if online == self.online {
            return false;
        }
        self.online = online;
        true
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.online.contains(&user)
    }

    /// Online users, in a stable order
    pub fn online(&self) -> Vec<UserId> {
        self.online.iter().copied().collect()
    }

    /// Note the author of a remote change
    pub fn record_contributor(&mut self, user: UserId) {
        if !self.contributors.contains(&user) {
            self.contributors.push(user);
        }
    }

    pub fn contributors(&self) -> &[UserId] {
        &self.contributors
    }

    /// Number of online users
    pub fn count(&self) -> usize {
        self.online.len()
    }
}
