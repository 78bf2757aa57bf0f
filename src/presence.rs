use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use tokio::time::Instant;

/// Who is connected to the room, as of the last `onlineUsers` snapshot.
///
/// Each snapshot replaces the set wholesale. With a zero grace window (the
/// default) a participant missing from the latest snapshot is offline at once;
/// a non-zero window keeps dropped participants online until it runs out, so a
/// short reconnect does not flicker.
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    online: HashSet<String>,
    lingering: HashMap<String, Instant>,
    grace: Duration,
}

impl PresenceTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            ..Self::default()
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: impl IntoIterator<Item = String>, now: Instant) {
        let next: HashSet<String> = snapshot.into_iter().collect();

        if !self.grace.is_zero() {
            for gone in self.online.difference(&next) {
                self.lingering.insert(gone.clone(), now + self.grace);
            }
        }
        self.lingering
            .retain(|id, until| !next.contains(id) && *until > now);
        self.online = next;
    }

    pub fn is_online(&self, participant_id: &str) -> bool {
        self.is_online_at(participant_id, Instant::now())
    }

    pub fn is_online_at(&self, participant_id: &str, now: Instant) -> bool {
        self.online.contains(participant_id)
            || self
                .lingering
                .get(participant_id)
                .is_some_and(|until| *until > now)
    }

    /// Participants of the latest snapshot, sorted.
    pub fn snapshot(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.online.iter().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn clear(&mut self) {
        self.online.clear();
        self.lingering.clear();
    }
}
