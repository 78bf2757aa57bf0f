use crate::{
    error::{ChatError, ChatResult},
    model::{Message, Participant, RoomKey},
};

/// Local input of the chat view.
#[derive(Debug, Clone)]
pub struct Composer {
    author: Participant,
    room: RoomKey,
    input: String,
}

impl Composer {
    pub fn new(author: Participant, room: RoomKey) -> Self {
        Self {
            author,
            room,
            input: String::new(),
        }
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
    }

    /// Turns the current input into a candidate and clears the input.
    ///
    /// Blank input is rejected and left untouched.
    pub fn send(&mut self) -> ChatResult<Message> {
        let body = self.input.trim();
        if body.is_empty() {
            return Err(ChatError::Validation("empty message"));
        }

        let candidate = Message::candidate(self.author.clone(), body, self.room.clone());
        self.input.clear();
        Ok(candidate)
    }
}
