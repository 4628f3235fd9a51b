//! Wire protocol for the WebSocket channel: one JSON object per logical
//! message in both directions, discriminated by a `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::db::models::StoredMessage;

/// A decoded inbound client message.
///
/// Decoding is two-step: the `type` discriminant is read first, then the
/// payload is decoded into the matching variant. Field-level validation
/// (non-empty strings, non-zero ids) is the dispatcher's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    SendMessage { to: String, content: String },
    SendGroupMessage { group_id: i64, content: String },
    History { with: String },
    HistoryGroup { group_id: i64 },
    Typing { to: Option<String>, group_id: Option<i64> },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame was not parseable JSON at all. Fatal to the session.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Valid JSON but not an object with a string `type` field.
    #[error("message must be an object with a string `type` field")]
    MissingType,
    /// The `type` value is not one the server understands.
    #[error("unknown message type")]
    UnknownType(String),
    /// Known type, but the payload does not have the required shape.
    #[error("malformed `{kind}` payload: {source}")]
    Malformed {
        kind: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct PrivatePayload {
    to: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct GroupPayload {
    group_id: i64,
    content: String,
}

#[derive(Debug, Deserialize)]
struct HistoryPayload {
    with: String,
}

#[derive(Debug, Deserialize)]
struct GroupIdPayload {
    group_id: i64,
}

#[derive(Debug, Deserialize)]
struct TypingPayload {
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    group_id: Option<i64>,
}

/// Decode one inbound text frame into a `ClientMessage`.
pub fn decode(text: &str) -> Result<ClientMessage, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err(DecodeError::MissingType),
    };

    match kind.as_str() {
        "send_message" | "private" => {
            let payload: PrivatePayload = decode_payload(value, "send_message")?;
            Ok(ClientMessage::SendMessage {
                to: payload.to,
                content: payload.content,
            })
        }
        "send_group_message" | "group" => {
            let payload: GroupPayload = decode_payload(value, "send_group_message")?;
            Ok(ClientMessage::SendGroupMessage {
                group_id: payload.group_id,
                content: payload.content,
            })
        }
        "history" => {
            let payload: HistoryPayload = decode_payload(value, "history")?;
            Ok(ClientMessage::History { with: payload.with })
        }
        "history_group" => {
            let payload: GroupIdPayload = decode_payload(value, "history_group")?;
            Ok(ClientMessage::HistoryGroup {
                group_id: payload.group_id,
            })
        }
        "typing" => {
            let payload: TypingPayload = decode_payload(value, "typing")?;
            Ok(ClientMessage::Typing {
                to: payload.to,
                group_id: payload.group_id,
            })
        }
        _ => Err(DecodeError::UnknownType(kind)),
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    value: Value,
    kind: &'static str,
) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::Malformed { kind, source })
}

impl DecodeError {
    /// The text sent back to the client as an inline error push.
    pub fn client_message(&self) -> String {
        match self {
            DecodeError::Json(_) => "invalid message".to_string(),
            DecodeError::MissingType => {
                "message must be an object with a string `type` field".to_string()
            }
            DecodeError::UnknownType(_) => "unknown message type".to_string(),
            DecodeError::Malformed { kind, .. } => format!("malformed `{kind}` payload"),
        }
    }
}

/// An outbound push, serialized with a `type` tag matching the variant name.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    NewMessage {
        from: String,
        content: String,
        ts: String,
    },
    NewGroupMessage {
        group_id: i64,
        from: String,
        content: String,
        ts: String,
    },
    History {
        with: String,
        messages: Vec<StoredMessage>,
    },
    HistoryGroup {
        group_id: i64,
        messages: Vec<StoredMessage>,
    },
    UserTyping {
        from: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        group_id: Option<i64>,
    },
    Error {
        msg: String,
    },
}
