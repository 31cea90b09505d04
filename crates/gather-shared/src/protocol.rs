use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, ValidationError};
use crate::types::{MessageId, UserIdentity};

/// A direct message between two users.
///
/// `id` is assigned by the server; it is `None` only for a local echo that
/// has not been acknowledged yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub sender_id: UserIdentity,
    pub receiver_id: UserIdentity,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// The other participant, seen from `local`.
    pub fn peer_of(&self, local: &UserIdentity) -> &UserIdentity {
        if &self.sender_id == local {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    pub fn is_from(&self, user: &UserIdentity) -> bool {
        &self.sender_id == user
    }
}

/// Server acknowledgment of a `sendMessage` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
}

/// Frames sent by the client over the chat socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Presence announcement for the local identity
    Join { identity: UserIdentity },

    /// Message submission; answered by `Ack` or `Nack` with the same correlation id
    #[serde(rename_all = "camelCase")]
    SendMessage {
        correlation_id: u64,
        sender_id: UserIdentity,
        receiver_id: UserIdentity,
        content: String,
    },
}

/// Frames pushed by the server over the chat socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Full list of online users, replaces any prior presence state
    PresenceSnapshot { identities: Vec<UserIdentity> },

    PeerOnline { identity: UserIdentity },

    PeerOffline { identity: UserIdentity },

    /// Any message involving the receiving socket's identity
    MessageReceived { message: Message },

    #[serde(rename_all = "camelCase")]
    Ack {
        correlation_id: u64,
        id: MessageId,
        created_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    Nack { correlation_id: u64, reason: String },
}

fn encode<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(text)
}

fn decode<'a, T: Deserialize<'a>>(text: &'a str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_str(text)?)
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        encode(self)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode(text)
    }
}

impl ServerFrame {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        encode(self)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode(text)
    }
}

/// Trim message content and enforce the non-empty / length rules.
pub fn normalize_content(raw: &str, max_len: usize) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    let len = trimmed.chars().count();
    if len > max_len {
        return Err(ValidationError::ContentTooLong { len, max: max_len });
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> UserIdentity {
        UserIdentity::parse(name).unwrap()
    }

    #[test]
    fn test_client_frame_wire_shape() {
        let frame = ClientFrame::SendMessage {
            correlation_id: 7,
            sender_id: user("u1"),
            receiver_id: user("u2"),
            content: "hello".into(),
        };

        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "sendMessage");
        assert_eq!(value["data"]["correlationId"], 7);
        assert_eq!(value["data"]["senderId"], "u1");
        assert_eq!(value["data"]["receiverId"], "u2");
    }

    #[test]
    fn test_server_frame_decodes_message_push() {
        let text = r#"{"event":"messageReceived","data":{"message":{
            "id":"m2","senderId":"u2","receiverId":"u1",
            "content":"hi","createdAt":"2024-05-01T10:00:00Z"}}}"#;

        match ServerFrame::from_json(text).unwrap() {
            ServerFrame::MessageReceived { message } => {
                assert_eq!(message.id, Some(MessageId::from("m2")));
                assert_eq!(message.content, "hi");
                assert_eq!(message.peer_of(&user("u1")), &user("u2"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_blank_identity_in_frame_rejected() {
        let text = r#"{"event":"peerOnline","data":{"identity":"  "}}"#;
        assert!(ServerFrame::from_json(text).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let text = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            ServerFrame::from_json(&text),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_normalize_content() {
        assert_eq!(normalize_content("  hello \n", 10).unwrap(), "hello");
        assert_eq!(
            normalize_content(" \t ", 10),
            Err(ValidationError::EmptyContent)
        );
        assert_eq!(
            normalize_content("abcdef", 3),
            Err(ValidationError::ContentTooLong { len: 6, max: 3 })
        );
    }
}
