use crate::models::{Message, Room};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound WebSocket events from client to server
///
/// Any `type` other than the ones listed decodes as `Unknown` and is ignored.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum WsInboundEvent {
    #[serde(rename = "message.send")]
    MessageSend { text: String },

    #[serde(other)]
    Unknown,
}

/// Outbound WebSocket events from server to client, encoded as `{type, data}`
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum WsOutboundEvent {
    /// A committed message, re-fetched from storage
    #[serde(rename = "message.new")]
    MessageNew(Message),

    /// First frame after admission
    #[serde(rename = "room.joined")]
    RoomJoined(Room),

    /// Sent only to the originating connection when its message was not persisted
    #[serde(rename = "message.failed")]
    MessageFailed { id: Uuid, reason: String },
}

impl WsOutboundEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
