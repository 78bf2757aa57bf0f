use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    error::{ChatError, ChatResult},
    model::{ComplaintId, Message, RoomKey},
    wire::WireMessage,
};

/// The REST side of the chat: message history and durable sends.
#[async_trait]
pub trait ComplaintApi: Send + Sync + 'static {
    /// Persisted messages of a complaint, oldest first.
    async fn fetch_history(&self, complaint: &ComplaintId) -> ChatResult<Vec<Message>>;

    /// Persists a message body and returns the stored message.
    async fn send_message(&self, complaint: &ComplaintId, body: &str) -> ChatResult<Message>;
}

#[derive(Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Clone, Debug)]
pub struct HttpComplaintApi {
    base_url: String,
    token: String,
    client: Client,
}

impl HttpComplaintApi {
    pub fn new(base_url: &str, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(client: Client, base_url: &str, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn check(
        response: reqwest::Response,
        what: impl FnOnce() -> String,
    ) -> ChatResult<reqwest::Response> {
        match response.status() {
            StatusCode::NOT_FOUND => Err(ChatError::not_found(what())),
            status if !status.is_success() => Err(ChatError::Transport(format!(
                "{} returned {status}",
                response.url()
            ))),
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl ComplaintApi for HttpComplaintApi {
    async fn fetch_history(&self, complaint: &ComplaintId) -> ChatResult<Vec<Message>> {
        let response = self
            .client
            .get(self.api_url(&format!("complaints/{complaint}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = Self::check(response, || format!("complaint {complaint}"))?;
        let HistoryResponse { messages } = response.json().await?;

        let messages = history_messages(messages, complaint.room_key());
        debug!(%complaint, count = messages.len(), "fetched history");
        Ok(messages)
    }

    async fn send_message(&self, complaint: &ComplaintId, body: &str) -> ChatResult<Message> {
        let response = self
            .client
            .post(self.api_url(&format!("complaints/{complaint}/message")))
            .bearer_auth(&self.token)
            .json(&json!({ "message": body }))
            .send()
            .await?;
        let response = Self::check(response, || format!("complaint {complaint}"))?;
        let value: Value = response.json().await?;

        let wire = persisted_message(value, body).ok_or_else(|| {
            ChatError::Protocol("send response did not contain the stored message".to_owned())
        })?;
        Ok(wire.into_message(complaint.room_key(), OffsetDateTime::now_utc()))
    }
}

/// Orders stored messages by `(created_at, id)`. A message without a stored
/// timestamp sorts first, so the same history always renders the same way.
fn history_messages(messages: Vec<WireMessage>, room: RoomKey) -> Vec<Message> {
    let mut messages: Vec<Message> = messages
        .into_iter()
        .map(|wire| wire.into_message(room.clone(), OffsetDateTime::UNIX_EPOCH))
        .collect();
    messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    messages
}

/// The backend answers a send with the message itself, `{message: {..}}`, or
/// the whole complaint; in the last case the newest message with our body is
/// the one just stored.
fn persisted_message(value: Value, body: &str) -> Option<WireMessage> {
    if value.get("sender").is_some() {
        return serde_json::from_value(value).ok();
    }
    if let Some(inner @ Value::Object(_)) = value.get("message") {
        return serde_json::from_value(inner.clone()).ok();
    }

    let messages = value
        .get("messages")
        .or_else(|| value.get("complaint").and_then(|c| c.get("messages")))?;
    let messages: Vec<WireMessage> = serde_json::from_value(messages.clone()).ok()?;
    let mut candidates = messages.into_iter().rev();
    let newest = candidates.clone().next();
    candidates
        .find(|m| {
            m.message.as_deref().or(m.text.as_deref()).or(m.body.as_deref()) == Some(body)
        })
        .or(newest)
}
