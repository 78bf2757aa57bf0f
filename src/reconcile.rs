//! The ordered, deduplicated message list of one room.
//!
//! Every mutation goes through [`MessageLog::apply`]. The list is kept sorted
//! by `(created_at, id)` and holds each id at most once. A candidate (temporary
//! id) is replaced by its durable copy when one shows up on the channel or in
//! history from the same sender with the same body within the supersede window.
//! Local candidates and accepted sends are only ever matched by id.

use std::collections::HashSet;

use time::Duration;

use crate::model::{Message, MessageId};

pub const DEFAULT_SUPERSEDE_WINDOW: Duration = Duration::seconds(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryState {
    Pending,
    Loaded,
    Failed,
}

#[derive(Debug, Clone)]
pub enum LogEvent {
    HistoryLoaded(Vec<Message>),
    HistoryFailed,
    /// A message pushed by the channel.
    MessageReceived(Message),
    /// A local candidate, appended optimistically before it is persisted.
    CandidateCreated(Message),
    SendAccepted { candidate: MessageId, durable: Message },
    SendFailed { candidate: MessageId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Added,
    Duplicate,
    /// Added, and a candidate it matched was dropped.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct MessageLog {
    messages: Vec<Message>,
    failed: HashSet<MessageId>,
    history: HistoryState,
    supersede_window: Duration,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new(DEFAULT_SUPERSEDE_WINDOW)
    }
}

impl MessageLog {
    pub fn new(supersede_window: Duration) -> Self {
        Self {
            messages: Vec::new(),
            failed: HashSet::new(),
            history: HistoryState::Pending,
            supersede_window,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn history_state(&self) -> HistoryState {
        self.history
    }

    pub fn is_failed(&self, id: &MessageId) -> bool {
        self.failed.contains(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns whether the visible list changed.
    pub fn apply(&mut self, event: LogEvent) -> bool {
        match event {
            LogEvent::HistoryLoaded(history) => {
                // whatever arrived live before history resolved is the live buffer
                let live = std::mem::take(&mut self.messages);
                self.messages = merge_with(history, live, self.supersede_window);
                self.failed.retain(|id| self.messages.iter().any(|m| &m.id == id));
                self.history = HistoryState::Loaded;
                true
            }
            LogEvent::HistoryFailed => {
                self.history = HistoryState::Failed;
                false
            }
            LogEvent::MessageReceived(msg) => self.insert(msg) != Insert::Duplicate,
            LogEvent::CandidateCreated(msg) => self.place(msg) != Insert::Duplicate,
            LogEvent::SendAccepted { candidate, durable } => {
                let removed = self.remove(&candidate);
                let inserted = self.place(durable);
                removed || inserted != Insert::Duplicate
            }
            LogEvent::SendFailed { candidate } => {
                if self.get(&candidate).is_some() {
                    self.failed.insert(candidate)
                } else {
                    false
                }
            }
        }
    }

    /// Inserts a message from the channel or from history, matching it against
    /// candidates by sender, body and time.
    pub fn insert(&mut self, msg: Message) -> Insert {
        if self.contains(&msg.id) {
            return Insert::Duplicate;
        }

        let mut outcome = Insert::Added;
        if msg.id.is_temporary() {
            // the durable copy already won
            if self
                .messages
                .iter()
                .any(|m| !m.id.is_temporary() && self.same_message(m, &msg))
            {
                return Insert::Duplicate;
            }
        } else if let Some(pos) = self
            .messages
            .iter()
            .position(|m| m.id.is_temporary() && self.same_message(m, &msg))
        {
            let candidate = self.messages.remove(pos);
            self.failed.remove(&candidate.id);
            outcome = Insert::Superseded;
        }

        self.insert_sorted(msg);
        outcome
    }

    /// Inserts a message whose identity is already known, without matching it
    /// against other candidates.
    fn place(&mut self, msg: Message) -> Insert {
        if self.contains(&msg.id) {
            return Insert::Duplicate;
        }
        self.insert_sorted(msg);
        Insert::Added
    }

    fn insert_sorted(&mut self, msg: Message) {
        let at = self
            .messages
            .binary_search_by(|m| m.sort_key().cmp(&msg.sort_key()))
            .unwrap_or_else(|at| at);
        self.messages.insert(at, msg);
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    fn remove(&mut self, id: &MessageId) -> bool {
        self.failed.remove(id);
        let before = self.messages.len();
        self.messages.retain(|m| &m.id != id);
        before != self.messages.len()
    }

    fn same_message(&self, a: &Message, b: &Message) -> bool {
        a.sender.id == b.sender.id
            && a.body == b.body
            && (a.created_at - b.created_at).abs() <= self.supersede_window
    }
}

/// Merges fetched history with messages that arrived before it resolved.
pub fn merge(history: Vec<Message>, live_buffer: Vec<Message>) -> Vec<Message> {
    merge_with(history, live_buffer, DEFAULT_SUPERSEDE_WINDOW)
}

pub fn merge_with(
    history: Vec<Message>,
    live_buffer: Vec<Message>,
    supersede_window: Duration,
) -> Vec<Message> {
    let mut log = MessageLog::new(supersede_window);
    // durable ids first so candidates in the buffer can be matched against them
    let (durable, temporary): (Vec<_>, Vec<_>) = history
        .into_iter()
        .chain(live_buffer)
        .partition(|m| !m.id.is_temporary());
    for msg in durable.into_iter().chain(temporary) {
        log.insert(msg);
    }
    log.messages
}

#[cfg(test)]
mod tests {
    use time::{OffsetDateTime, macros::datetime};

    use super::*;
    use crate::model::{ComplaintId, Participant};

    const T0: OffsetDateTime = datetime!(2024-03-01 10:00:00 UTC);

    fn msg(id: &str, sender: &str, body: &str, secs: i64) -> Message {
        Message {
            id: MessageId::new(id),
            sender: Participant::new(sender, sender.to_uppercase()),
            body: body.to_owned(),
            created_at: T0 + Duration::seconds(secs),
            room: ComplaintId::new("7").room_key(),
        }
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn merge_sorts_by_time_then_id_and_dedupes() {
        let history = vec![msg("m3", "a", "c", 2), msg("m1", "a", "a", 0), msg("m2", "b", "b", 0)];
        let live = vec![msg("m4", "b", "d", 1), msg("m3", "a", "c", 2), msg("m1", "a", "a", 0)];
        let merged = merge(history, live);
        assert_eq!(ids(&merged), ["m1", "m2", "m4", "m3"]);
    }

    #[test]
    fn history_then_live_keeps_chronological_order() {
        let mut log = MessageLog::default();
        log.apply(LogEvent::HistoryLoaded(vec![msg("m1", "a", "hi", 0)]));
        log.apply(LogEvent::MessageReceived(msg("m2", "b", "hello", 1)));
        assert_eq!(ids(log.messages()), ["m1", "m2"]);
        assert_eq!(log.history_state(), HistoryState::Loaded);
    }

    #[test]
    fn live_before_history_is_merged_not_overwritten() {
        let mut log = MessageLog::default();
        log.apply(LogEvent::MessageReceived(msg("m2", "b", "hello", 1)));
        log.apply(LogEvent::HistoryLoaded(vec![msg("m1", "a", "hi", 0), msg("m2", "b", "hello", 1)]));
        assert_eq!(ids(log.messages()), ["m1", "m2"]);
    }

    #[test]
    fn duplicate_delivery_is_ignored() {
        let mut log = MessageLog::default();
        assert!(log.apply(LogEvent::MessageReceived(msg("m1", "a", "hi", 0))));
        assert!(!log.apply(LogEvent::MessageReceived(msg("m1", "a", "hi", 0))));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn send_accepted_replaces_candidate() {
        let mut log = MessageLog::default();
        log.apply(LogEvent::CandidateCreated(msg("temp-1", "a", "test", 0)));
        log.apply(LogEvent::SendAccepted {
            candidate: MessageId::new("temp-1"),
            durable: msg("m99", "a", "test", 1),
        });
        assert_eq!(ids(log.messages()), ["m99"]);
    }

    #[test]
    fn durable_copy_from_channel_supersedes_candidate_before_send_returns() {
        let mut log = MessageLog::default();
        log.apply(LogEvent::CandidateCreated(msg("temp-1", "a", "test", 0)));
        assert_eq!(log.insert(msg("m99", "a", "test", 1)), Insert::Superseded);
        log.apply(LogEvent::SendAccepted {
            candidate: MessageId::new("temp-1"),
            durable: msg("m99", "a", "test", 1),
        });
        assert_eq!(ids(log.messages()), ["m99"]);
    }

    #[test]
    fn candidate_echo_after_durable_is_dropped() {
        let mut log = MessageLog::default();
        log.apply(LogEvent::HistoryLoaded(vec![msg("m5", "b", "ok", 3)]));
        assert!(!log.apply(LogEvent::MessageReceived(msg("temp-9", "b", "ok", 2))));
        assert_eq!(ids(log.messages()), ["m5"]);
    }

    #[test]
    fn supersede_requires_same_sender_body_and_window() {
        let mut log = MessageLog::new(Duration::seconds(5));
        log.apply(LogEvent::CandidateCreated(msg("temp-1", "a", "test", 0)));
        assert_eq!(log.insert(msg("m1", "b", "test", 1)), Insert::Added);
        assert_eq!(log.insert(msg("m2", "a", "other", 1)), Insert::Added);
        assert_eq!(log.insert(msg("m3", "a", "test", 60)), Insert::Added);
        assert!(log.get(&MessageId::new("temp-1")).is_some());
    }

    #[test]
    fn failed_candidate_stays_and_is_marked() {
        let mut log = MessageLog::default();
        log.apply(LogEvent::CandidateCreated(msg("temp-1", "a", "test", 0)));
        assert!(log.apply(LogEvent::SendFailed { candidate: MessageId::new("temp-1") }));
        assert!(log.is_failed(&MessageId::new("temp-1")));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn repeated_body_sends_settle_independently() {
        let mut log = MessageLog::default();
        log.apply(LogEvent::CandidateCreated(msg("temp-1", "a", "ok", 0)));
        log.apply(LogEvent::CandidateCreated(msg("temp-2", "a", "ok", 1)));
        log.apply(LogEvent::SendAccepted {
            candidate: MessageId::new("temp-1"),
            durable: msg("m99", "a", "ok", 2),
        });
        assert_eq!(ids(log.messages()), ["temp-2", "m99"]);

        assert!(log.apply(LogEvent::SendFailed { candidate: MessageId::new("temp-2") }));
        assert!(log.is_failed(&MessageId::new("temp-2")));
        assert_eq!(ids(log.messages()), ["temp-2", "m99"]);
    }

    #[test]
    fn candidate_repeating_a_saved_body_is_still_shown() {
        let mut log = MessageLog::default();
        log.apply(LogEvent::HistoryLoaded(vec![msg("m5", "a", "ok", 0)]));
        assert!(log.apply(LogEvent::CandidateCreated(msg("temp-1", "a", "ok", 1))));
        assert_eq!(ids(log.messages()), ["m5", "temp-1"]);
    }

    #[test]
    fn merge_replaces_buffered_candidate_with_saved_copy_from_history() {
        let history = vec![msg("m1", "b", "hi", 0), msg("m99", "a", "test", 2)];
        let live = vec![msg("temp-1", "a", "test", 1), msg("m2", "b", "yo", 3)];
        assert_eq!(ids(&merge(history, live)), ["m1", "m99", "m2"]);

        // also when the candidate is stamped after its saved copy
        let history = vec![msg("m99", "a", "test", 0)];
        let live = vec![msg("temp-1", "a", "test", 1)];
        assert_eq!(ids(&merge(history, live)), ["m99"]);
    }

    #[test]
    fn history_failure_keeps_live_messages() {
        let mut log = MessageLog::default();
        log.apply(LogEvent::MessageReceived(msg("m2", "b", "hello", 1)));
        assert!(!log.apply(LogEvent::HistoryFailed));
        assert_eq!(log.history_state(), HistoryState::Failed);
        assert_eq!(ids(log.messages()), ["m2"]);
    }

    #[test]
    fn merge_output_is_strictly_ordered_for_mixed_input() {
        let mut history = Vec::new();
        let mut live = Vec::new();
        for i in 0..40_i64 {
            let m = msg(&format!("m{:02}", (i * 7) % 40), "a", &i.to_string(), (i * 13) % 5);
            if i % 3 == 0 {
                live.push(m.clone());
            }
            if i % 2 == 0 {
                history.push(m);
            } else {
                live.push(m);
            }
        }
        let merged = merge(history, live);
        assert_eq!(merged.len(), 40);
        for pair in merged.windows(2) {
            assert!(pair[0].sort_key() < pair[1].sort_key());
        }
    }
}
