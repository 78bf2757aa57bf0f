use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

pub const DEFAULT_TYPING_WINDOW: Duration = Duration::from_millis(2000);
pub const DEFAULT_TYPING_THROTTLE: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq, Eq)]
struct TypingSignal {
    display_name: String,
    expires_at: Instant,
}

/// Remote "is typing" signals, one per participant, each with its own expiry.
#[derive(Debug, Clone)]
pub struct TypingIndicator {
    active: HashMap<String, TypingSignal>,
    window: Duration,
}

impl Default for TypingIndicator {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_WINDOW)
    }
}

impl TypingIndicator {
    pub fn new(window: Duration) -> Self {
        Self {
            active: HashMap::new(),
            window,
        }
    }

    /// Starts or refreshes the participant's signal for a fresh window.
    pub fn on_remote_typing(&mut self, participant_id: &str, display_name: &str, now: Instant) {
        self.active.insert(
            participant_id.to_owned(),
            TypingSignal {
                display_name: display_name.to_owned(),
                expires_at: now + self.window,
            },
        );
    }

    /// Drops signals whose window has run out. Returns whether any did.
    pub fn expire(&mut self, now: Instant) -> bool {
        let before = self.active.len();
        self.active.retain(|_, signal| signal.expires_at > now);
        before != self.active.len()
    }

    pub fn is_typing(&self, participant_id: &str, now: Instant) -> bool {
        self.active
            .get(participant_id)
            .is_some_and(|signal| signal.expires_at > now)
    }

    /// Display names of everyone still typing, sorted.
    pub fn typists(&self, now: Instant) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .active
            .values()
            .filter(|signal| signal.expires_at > now)
            .map(|signal| signal.display_name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// When the next signal runs out, if any is active.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.values().map(|signal| signal.expires_at).min()
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}

/// Limits outgoing typing signals to one per interval.
#[derive(Debug, Clone)]
pub struct TypingThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl Default for TypingThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_THROTTLE)
    }
}

impl TypingThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Whether a keystroke at `now` should emit; records the emission if so.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    /// Lets the next keystroke emit right away, e.g. after a send.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

/// Text for the typing banner, `None` when nobody is typing.
pub fn banner(typists: &[&str]) -> Option<String> {
    match typists {
        [] => None,
        [one] => Some(format!("{one} is typing...")),
        [first, second] => Some(format!("{first} and {second} are typing...")),
        [first, rest @ ..] => Some(format!("{first} and {} others are typing...", rest.len())),
    }
}
