use chrono::Utc;
use rusqlite::params;

use crate::db::models::StoredMessage;
use crate::db::DbPool;
use crate::store::StoreResult;

/// History queries return at most this many rows, oldest first.
const HISTORY_LIMIT: i64 = 100;

/// Insert a private message. The receiver subselect resolves to NULL for an
/// unknown username, which trips the messages CHECK constraint — the caller
/// reports that as "target user does not exist".
pub fn insert_private_message(
    db: &DbPool,
    sender: &str,
    receiver: &str,
    content: &str,
) -> StoreResult<()> {
    let conn = db.lock().map_err(|e| format!("DB lock error: {e}"))?;
    conn.execute(
        "INSERT INTO messages (sender_id, receiver_id, content, created_at)
         VALUES ((SELECT id FROM users WHERE username = ?1),
                 (SELECT id FROM users WHERE username = ?2),
                 ?3, ?4)",
        params![sender, receiver, content, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Insert a group message.
pub fn insert_group_message(
    db: &DbPool,
    sender: &str,
    group_id: i64,
    content: &str,
) -> StoreResult<()> {
    let conn = db.lock().map_err(|e| format!("DB lock error: {e}"))?;
    conn.execute(
        "INSERT INTO messages (sender_id, group_id, content, created_at)
         VALUES ((SELECT id FROM users WHERE username = ?1), ?2, ?3, ?4)",
        params![sender, group_id, content, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Private chat history between two users, oldest first, capped.
pub fn private_history(db: &DbPool, user_a: &str, user_b: &str) -> StoreResult<Vec<StoredMessage>> {
    let conn = db.lock().map_err(|e| format!("DB lock error: {e}"))?;
    let mut stmt = conn.prepare(
        "SELECT m.id, u1.username, u2.username, m.group_id, m.content, m.created_at
         FROM messages m
         JOIN users u1 ON m.sender_id = u1.id
         JOIN users u2 ON m.receiver_id = u2.id
         WHERE (u1.username = ?1 AND u2.username = ?2)
            OR (u1.username = ?2 AND u2.username = ?1)
         ORDER BY m.created_at ASC, m.id ASC
         LIMIT ?3",
    )?;
    let messages = stmt
        .query_map(params![user_a, user_b, HISTORY_LIMIT], |row| {
            Ok(StoredMessage {
                id: row.get(0)?,
                sender: row.get(1)?,
                receiver: row.get(2)?,
                group_id: row.get(3)?,
                content: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

/// Group chat history, oldest first, capped. Group rows have no receiver;
/// the single query selects both optional columns so the row shape never
/// needs a second pass.
pub fn group_history(db: &DbPool, group_id: i64) -> StoreResult<Vec<StoredMessage>> {
    let conn = db.lock().map_err(|e| format!("DB lock error: {e}"))?;
    let mut stmt = conn.prepare(
        "SELECT m.id, u.username, r.username, m.group_id, m.content, m.created_at
         FROM messages m
         JOIN users u ON m.sender_id = u.id
         LEFT JOIN users r ON m.receiver_id = r.id
         WHERE m.group_id = ?1
         ORDER BY m.created_at ASC, m.id ASC
         LIMIT ?2",
    )?;
    let messages = stmt
        .query_map(params![group_id, HISTORY_LIMIT], |row| {
            Ok(StoredMessage {
                id: row.get(0)?,
                sender: row.get(1)?,
                receiver: row.get(2)?,
                group_id: row.get(3)?,
                content: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::store::groups;

    fn seed_user(db: &DbPool, username: &str) {
        let conn = db.lock().unwrap();
        conn.execute(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?1, 'x', ?2)",
            params![username, Utc::now().to_rfc3339()],
        )
        .unwrap();
    }

    #[test]
    fn private_history_is_bidirectional_and_oldest_first() {
        let db = init_test_db();
        seed_user(&db, "alice");
        seed_user(&db, "bob");

        insert_private_message(&db, "alice", "bob", "one").unwrap();
        insert_private_message(&db, "bob", "alice", "two").unwrap();
        insert_private_message(&db, "alice", "bob", "three").unwrap();

        let history = private_history(&db, "alice", "bob").unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
        assert_eq!(history[1].sender, "bob");
        assert_eq!(history[1].receiver.as_deref(), Some("alice"));
        assert!(history[0].group_id.is_none());

        // Same result regardless of argument order.
        let flipped = private_history(&db, "bob", "alice").unwrap();
        assert_eq!(flipped.len(), 3);
    }

    #[test]
    fn private_history_is_capped_at_the_oldest_hundred() {
        let db = init_test_db();
        seed_user(&db, "alice");
        seed_user(&db, "bob");

        for i in 0..105 {
            insert_private_message(&db, "alice", "bob", &format!("msg-{i}")).unwrap();
        }

        let history = private_history(&db, "alice", "bob").unwrap();
        assert_eq!(history.len(), 100);
        assert_eq!(history[0].content, "msg-0");
        assert_eq!(history[99].content, "msg-99");
    }

    #[test]
    fn insert_to_unknown_receiver_fails() {
        let db = init_test_db();
        seed_user(&db, "alice");
        assert!(insert_private_message(&db, "alice", "ghost", "hello").is_err());

        let count: i64 = {
            let conn = db.lock().unwrap();
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
                .unwrap()
        };
        assert_eq!(count, 0);
    }

    #[test]
    fn group_history_rows_have_no_receiver() {
        let db = init_test_db();
        seed_user(&db, "alice");
        seed_user(&db, "bob");
        let group_id = groups::create_group(&db, "team", "alice").unwrap();
        groups::add_member(&db, group_id, "bob").unwrap();

        insert_group_message(&db, "alice", group_id, "hello team").unwrap();
        insert_group_message(&db, "bob", group_id, "hi").unwrap();

        let history = group_history(&db, group_id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sender, "alice");
        assert!(history[0].receiver.is_none());
        assert_eq!(history[0].group_id, Some(group_id));
    }

    #[test]
    fn insert_to_unknown_group_fails() {
        let db = init_test_db();
        seed_user(&db, "alice");
        assert!(insert_group_message(&db, "alice", 999, "hello").is_err());
    }
}
