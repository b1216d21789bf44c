use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted chat message, matching the `messages` table
///
/// `username` is not stored with the row; it is resolved from `users` when the
/// message is fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub room: Uuid,
    pub sender_id: Uuid,
    pub username: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// Build a new message stamped with a fresh id and the server clock.
    ///
    /// The timestamp is truncated to microseconds, the resolution of
    /// PostgreSQL `timestamptz`, so the fetched row equals the one inserted.
    pub fn compose(room: Uuid, sender_id: Uuid, username: &str, body: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            room,
            sender_id,
            username: username.to_string(),
            body,
            sent_at: Utc::now().trunc_subsecs(6),
        }
    }

    pub fn notification(&self) -> ChangeNotification {
        ChangeNotification {
            room: self.room,
            id: self.id,
        }
    }
}

/// Out-of-band `{room, id}` envelope published when a message commits.
///
/// Only identifiers travel on the channel; listeners re-fetch the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub room: Uuid,
    pub id: Uuid,
}

impl ChangeNotification {
    /// PostgreSQL rejects NOTIFY payloads of 8000 bytes or more.
    pub const MAX_PAYLOAD_BYTES: usize = 8000;

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
