// Copyright 2024. The Tari Project

use axum::response::sse::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// All frames that can be pushed to a connected client.
///
/// The set is closed on purpose: consumers match on it exhaustively, so a new
/// frame kind shows up as a compile error at every dispatch site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EventFrame {
    /// Stream accepted by the server
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    /// Periodic keep-alive, carries nothing
    #[serde(rename = "heartbeat")]
    Heartbeat,

    /// A chat message was written for the receiving user
    #[serde(rename = "new_message")]
    NewMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<Value>,
    },

    /// Conversation list or unread counts changed, client should refetch
    #[serde(rename = "conversation_update")]
    ConversationUpdate,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl EventFrame {
    pub fn connected(user_id: impl Into<String>) -> Self {
        EventFrame::Connected {
            user_id: Some(user_id.into()),
        }
    }

    pub fn new_message(message: Value) -> Self {
        EventFrame::NewMessage {
            message: Some(message),
        }
    }

    /// Get the wire tag of this frame
    pub fn event_type(&self) -> &'static str {
        match self {
            EventFrame::Connected { .. } => "connected",
            EventFrame::Heartbeat => "heartbeat",
            EventFrame::NewMessage { .. } => "new_message",
            EventFrame::ConversationUpdate => "conversation_update",
        }
    }

    pub fn to_json(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the `data` text of one stream message
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Render as a `data: <JSON>\n\n` block on the response body
    pub fn to_sse_event(&self) -> Result<Event, FrameError> {
        Ok(Event::default().data(self.to_json()?))
    }

    /// The raw bytes written to the wire for this frame.
    pub fn to_wire(&self) -> Result<String, FrameError> {
        Ok(format!("data: {}\n\n", self.to_json()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frames_serialize_with_type_tag() {
        assert_eq!(
            serde_json::to_value(EventFrame::connected("user-1")).unwrap(),
            json!({"type": "connected", "userId": "user-1"})
        );
        assert_eq!(
            serde_json::to_value(EventFrame::Heartbeat).unwrap(),
            json!({"type": "heartbeat"})
        );
        assert_eq!(
            serde_json::to_value(EventFrame::new_message(json!({"id": "m1"}))).unwrap(),
            json!({"type": "new_message", "message": {"id": "m1"}})
        );
        assert_eq!(
            serde_json::to_value(EventFrame::ConversationUpdate).unwrap(),
            json!({"type": "conversation_update"})
        );
    }

    #[test]
    fn test_parse_new_message() {
        let frame =
            EventFrame::parse(r#"{"type":"new_message","message":{"id":"m1","content":"hi"}}"#)
                .unwrap();
        assert_eq!(
            frame,
            EventFrame::NewMessage {
                message: Some(json!({"id": "m1", "content": "hi"}))
            }
        );
    }

    #[test]
    fn test_parse_tolerates_missing_optional_fields() {
        assert_eq!(
            EventFrame::parse(r#"{"type":"new_message"}"#).unwrap(),
            EventFrame::NewMessage { message: None }
        );
        assert_eq!(
            EventFrame::parse(r#"{"type":"connected"}"#).unwrap(),
            EventFrame::Connected { user_id: None }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_tag_and_bad_json() {
        assert!(EventFrame::parse(r#"{"type":"presence"}"#).is_err());
        assert!(EventFrame::parse(r#"{"message":{}}"#).is_err());
        assert!(EventFrame::parse("not json").is_err());
    }

    #[test]
    fn test_wire_framing() {
        assert_eq!(
            EventFrame::Heartbeat.to_wire().unwrap(),
            "data: {\"type\":\"heartbeat\"}\n\n"
        );
    }

    #[test]
    fn test_event_type_matches_serialized_tag() {
        let frames = [
            EventFrame::connected("u"),
            EventFrame::Heartbeat,
            EventFrame::new_message(json!({})),
            EventFrame::ConversationUpdate,
        ];
        for frame in frames {
            let value = serde_json::to_value(&frame).unwrap();
            assert_eq!(value["type"], frame.event_type());
        }
    }
}
