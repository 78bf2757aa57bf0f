use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub const ROOM_PREFIX: &str = "complaint_";
pub const TEMP_ID_PREFIX: &str = "temp-";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComplaintId(String);

impl ComplaintId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn room_key(&self) -> RoomKey {
        RoomKey(format!("{ROOM_PREFIX}{}", self.0))
    }
}

impl fmt::Display for ComplaintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Channel room for one complaint, `complaint_<id>`. Sender and receivers
/// must agree on it byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.strip_prefix(ROOM_PREFIX) {
            Some(id) if !id.is_empty() => Some(Self(raw.to_owned())),
            _ => None,
        }
    }

    pub fn complaint_id(&self) -> ComplaintId {
        ComplaintId::new(self.0.strip_prefix(ROOM_PREFIX).unwrap_or(&self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A client-side id for a candidate that has not been persisted yet.
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::now_v7()))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// The identity the hosting page authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    #[serde(alias = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: String,
}

impl AuthUser {
    pub fn participant(&self) -> Participant {
        Participant::new(&self.id, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender: Participant,
    pub body: String,
    pub created_at: OffsetDateTime,
    pub room: RoomKey,
}

impl Message {
    /// Local, not yet persisted message with a temporary id.
    pub fn candidate(sender: Participant, body: impl Into<String>, room: RoomKey) -> Self {
        Self {
            id: MessageId::temporary(),
            sender,
            body: body.into(),
            created_at: OffsetDateTime::now_utc(),
            room,
        }
    }

    /// Ordering key of every message list: creation time, then id.
    pub fn sort_key(&self) -> (OffsetDateTime, &MessageId) {
        (self.created_at, &self.id)
    }

    pub fn is_from(&self, participant_id: &str) -> bool {
        self.sender.id == participant_id
    }
}
