use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::DbPool;
use crate::store::StoreResult;

/// Create a group and add the creator as its first member, in one
/// transaction.
pub fn create_group(db: &DbPool, name: &str, creator: &str) -> StoreResult<i64> {
    let mut conn = db.lock().map_err(|e| format!("DB lock error: {e}"))?;
    let tx = conn.transaction()?;
    let now = Utc::now().to_rfc3339();

    let creator_id: i64 = tx.query_row(
        "SELECT id FROM users WHERE username = ?1",
        [creator],
        |row| row.get(0),
    )?;

    tx.execute(
        "INSERT INTO groups (name, creator_id, created_at) VALUES (?1, ?2, ?3)",
        params![name, creator_id, now],
    )?;
    let group_id = tx.last_insert_rowid();

    tx.execute(
        "INSERT INTO group_members (group_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
        params![group_id, creator_id, now],
    )?;

    tx.commit()?;
    Ok(group_id)
}

/// Add a user to a group. `Ok(None)` means the username does not exist;
/// constraint violations (duplicate member, unknown group) surface as errors.
pub fn add_member(db: &DbPool, group_id: i64, username: &str) -> StoreResult<Option<()>> {
    let conn = db.lock().map_err(|e| format!("DB lock error: {e}"))?;

    let user_id: Option<i64> = conn
        .query_row(
            "SELECT id FROM users WHERE username = ?1",
            [username],
            |row| row.get(0),
        )
        .optional()?;
    let Some(user_id) = user_id else {
        return Ok(None);
    };

    conn.execute(
        "INSERT INTO group_members (group_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
        params![group_id, user_id, Utc::now().to_rfc3339()],
    )?;
    Ok(Some(()))
}

/// All member usernames of a group.
pub fn group_members(db: &DbPool, group_id: i64) -> StoreResult<Vec<String>> {
    let conn = db.lock().map_err(|e| format!("DB lock error: {e}"))?;
    let mut stmt = conn.prepare(
        "SELECT u.username
         FROM users u
         JOIN group_members gm ON u.id = gm.user_id
         WHERE gm.group_id = ?1",
    )?;
    let members = stmt
        .query_map([group_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(members)
}

/// Whether a user belongs to a group. Unknown users are simply not members.
pub fn is_member(db: &DbPool, username: &str, group_id: i64) -> StoreResult<bool> {
    let conn = db.lock().map_err(|e| format!("DB lock error: {e}"))?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*)
         FROM group_members gm
         JOIN users u ON u.id = gm.user_id
         WHERE gm.group_id = ?1 AND u.username = ?2",
        params![group_id, username],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
