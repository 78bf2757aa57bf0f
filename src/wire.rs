//! Socket.IO (v5 over Engine.IO v4) text frames and the chat events carried
//! in them.
//!
//! Only the websocket transport and the default namespace are spoken. A frame
//! is an Engine.IO packet type digit, and for Engine.IO `message` packets a
//! Socket.IO packet type digit followed by JSON:
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,"pingTimeout":20000}   open
//! 2 / 3                                                    ping / pong
//! 40{"token":".."}                                         namespace connect
//! 42["newMessage",{..}]                                    event
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::{
    error::{ChatError, ChatResult},
    model::{ComplaintId, Message, MessageId, Participant, RoomKey},
};

pub const EV_JOIN_ROOM: &str = "joinRoom";
pub const EV_NEW_MESSAGE: &str = "newMessage";
pub const EV_ONLINE_USERS: &str = "onlineUsers";
pub const EV_TYPING: &str = "typing";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

impl Handshake {
    /// How long the server may stay silent before the link counts as dead:
    /// one ping interval plus the time allowed for it to arrive.
    pub fn liveness(&self) -> Option<Duration> {
        match self.ping_interval.saturating_add(self.ping_timeout) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    /// Namespace connect: the auth object from the client, `{sid}` from the server.
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, payload: Value },
    ConnectError(String),
    Noop,
}

impl Packet {
    pub fn event(name: &str, payload: Value) -> Self {
        Self::Event {
            name: name.to_owned(),
            payload,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Packet::Open(hs) => format!(
                "0{}",
                json!({
                    "sid": hs.sid,
                    "pingInterval": hs.ping_interval,
                    "pingTimeout": hs.ping_timeout,
                })
            ),
            Packet::Close => "1".to_owned(),
            Packet::Ping => "2".to_owned(),
            Packet::Pong => "3".to_owned(),
            Packet::Connect(None) => "40".to_owned(),
            Packet::Connect(Some(auth)) => format!("40{auth}"),
            Packet::Disconnect => "41".to_owned(),
            Packet::Event { name, payload } => {
                let args = if payload.is_null() {
                    json!([name])
                } else {
                    json!([name, payload])
                };
                format!("42{args}")
            }
            Packet::ConnectError(message) => format!("44{}", json!({ "message": message })),
            Packet::Noop => "6".to_owned(),
        }
    }

    pub fn decode(frame: &str) -> ChatResult<Self> {
        let mut chars = frame.chars();
        let engine = chars
            .next()
            .ok_or_else(|| ChatError::Protocol("empty frame".to_owned()))?;
        let rest = chars.as_str();

        match engine {
            '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => decode_socket(rest),
            '6' => Ok(Packet::Noop),
            other => Err(ChatError::Protocol(format!(
                "unsupported engine packet type {other:?}"
            ))),
        }
    }
}

fn decode_socket(frame: &str) -> ChatResult<Packet> {
    let mut chars = frame.chars();
    let kind = chars
        .next()
        .ok_or_else(|| ChatError::Protocol("empty socket packet".to_owned()))?;
    let body = skip_namespace(chars.as_str());

    match kind {
        '0' => {
            let body = body.trim();
            if body.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                Ok(Packet::Connect(Some(serde_json::from_str(body)?)))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            // ack id, when present, sits between the type and the array
            let body = body.trim_start_matches(|c: char| c.is_ascii_digit());
            let mut args: Vec<Value> = serde_json::from_str(body)?;
            if args.is_empty() {
                return Err(ChatError::Protocol("event without a name".to_owned()));
            }
            let name = match args.remove(0) {
                Value::String(name) => name,
                other => {
                    return Err(ChatError::Protocol(format!(
                        "event name must be a string, got {other}"
                    )));
                }
            };
            let payload = if args.is_empty() {
                Value::Null
            } else {
                args.remove(0)
            };
            Ok(Packet::Event { name, payload })
        }
        '4' => {
            let message = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_owned))
                .unwrap_or_else(|| body.to_owned());
            Ok(Packet::ConnectError(message))
        }
        other => Err(ChatError::Protocol(format!(
            "unsupported socket packet type {other:?}"
        ))),
    }
}

/// Drops a `/namespace,` prefix; the default namespace has none.
fn skip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        body.split_once(',').map_or("", |(_, rest)| rest)
    } else {
        body
    }
}

/// Message as the backend and other clients serialize it.
#[derive(Debug, Clone, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub sender: Participant,
    #[serde(default)]
    pub message: Option<String>,
    /// Legacy body field.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(
        default,
        rename = "createdAt",
        with = "time::serde::rfc3339::option"
    )]
    pub created_at: Option<OffsetDateTime>,
}

impl WireMessage {
    /// `fallback` stands in for a missing `createdAt`.
    pub fn into_message(self, room: RoomKey, fallback: OffsetDateTime) -> Message {
        let body = self
            .message
            .or(self.text)
            .or(self.body)
            .unwrap_or_default();

        Message {
            id: MessageId::new(self.id),
            sender: self.sender,
            body,
            created_at: self.created_at.unwrap_or(fallback),
            room,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub sender: Participant,
    pub message: String,
    #[serde(rename = "createdAt", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&Message> for OutgoingMessage {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            sender: msg.sender.clone(),
            message: msg.body.clone(),
            created_at: msg.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub complaint_id: ComplaintId,
    pub message: OutgoingMessage,
    pub room: RoomKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    #[serde(default)]
    pub room: Option<String>,
    pub user: String,
    #[serde(default)]
    pub user_name: String,
}

/// A `newMessage` as received, with the room it claims to belong to if it
/// names one.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: WireMessage,
    pub room: Option<String>,
}

impl IncomingMessage {
    /// Accepts the flat `{...message}` form and the `{complaintId, message, room}`
    /// envelope other clients send.
    pub fn from_payload(payload: Value) -> ChatResult<Self> {
        let (inner, room) = match payload.get("message") {
            Some(Value::Object(_)) => {
                let room = room_tag(&payload);
                let inner = payload
                    .get("message")
                    .cloned()
                    .unwrap_or(Value::Null);
                (inner, room)
            }
            _ => {
                let room = room_tag(&payload);
                (payload, room)
            }
        };

        Ok(Self {
            message: serde_json::from_value(inner)?,
            room,
        })
    }

    pub fn belongs_to(&self, room: &RoomKey) -> bool {
        self.room.as_deref().is_none_or(|tag| tag == room.as_str())
    }
}

fn room_tag(payload: &Value) -> Option<String> {
    if let Some(room) = payload.get("room").and_then(Value::as_str) {
        return Some(room.to_owned());
    }
    payload
        .get("complaintId")
        .and_then(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .map(|id| ComplaintId::new(id).room_key().as_str().to_owned())
}

/// Events the channel understands, decoded from `42` packets.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    NewMessage(IncomingMessage),
    OnlineUsers(Vec<String>),
    Typing(TypingPayload),
    Unknown(String),
}

impl ChannelEvent {
    pub fn from_event(name: &str, payload: Value) -> ChatResult<Self> {
        match name {
            EV_NEW_MESSAGE => Ok(Self::NewMessage(IncomingMessage::from_payload(payload)?)),
            EV_ONLINE_USERS => Ok(Self::OnlineUsers(serde_json::from_value(payload)?)),
            EV_TYPING => Ok(Self::Typing(serde_json::from_value(payload)?)),
            other => Ok(Self::Unknown(other.to_owned())),
        }
    }
}

/// Events the client sends.
#[derive(Debug, Clone)]
pub enum Emit {
    JoinRoom(RoomKey),
    NewMessage(NewMessagePayload),
    Typing(TypingPayload),
}

impl Emit {
    pub fn into_packet(self) -> ChatResult<Packet> {
        Ok(match self {
            Emit::JoinRoom(room) => Packet::event(EV_JOIN_ROOM, Value::String(room.to_string())),
            Emit::NewMessage(payload) => {
                Packet::event(EV_NEW_MESSAGE, serde_json::to_value(payload)?)
            }
            Emit::Typing(payload) => Packet::event(EV_TYPING, serde_json::to_value(payload)?),
        })
    }
}
