use thiserror::Error;

use crate::model::MessageId;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Connection or channel failure. Recoverable: the caller discards the
    /// channel and may build a fresh one.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{what} not found")]
    NotFound { what: String },

    /// The durable send failed after the candidate was already broadcast.
    #[error("failed to persist message {candidate}: {reason}")]
    Persistence { candidate: MessageId, reason: String },

    /// Input the composer refuses to send, such as a blank message.
    #[error("invalid input: {0}")]
    Validation(&'static str),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("channel is {state}, cannot {action}")]
    InvalidState { state: &'static str, action: &'static str },

    #[error("config: {0}")]
    Config(String),
}

impl ChatError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

macro_rules! transport_err_impl {
    ($E:ty) => {
        impl From<$E> for ChatError {
            fn from(err: $E) -> Self {
                Self::Transport(err.to_string())
            }
        }
    };
}

transport_err_impl!(reqwest::Error);
transport_err_impl!(tokio_tungstenite::tungstenite::Error);
transport_err_impl!(url::ParseError);

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
