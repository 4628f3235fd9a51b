use serde::Serialize;

/// A persisted chat message as returned by history queries.
/// Exactly one of `receiver` / `group_id` is set, mirroring the CHECK
/// constraint on the messages table; the unset side is omitted from JSON.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub sender: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    pub content: String,
    /// UTC RFC 3339, as stored.
    pub created_at: String,
}

/// A user row as exposed by the roster endpoint. Never carries the
/// password hash.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub creator_id: i64,
    pub created_at: String,
}
