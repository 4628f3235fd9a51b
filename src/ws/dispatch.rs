//! Interprets decoded inbound messages: validates fields, talks to the
//! store, and constructs the outbound pushes.
//!
//! Every failure here is non-fatal to the session: validation, authorization
//! and persistence problems turn into an inline `error` push on the
//! originating connection (or a silent drop on the group-typing path) and
//! the read loop keeps going.

use axum::extract::ws::Message;
use chrono::Local;

use crate::state::AppState;
use crate::store::{groups, messages};
use crate::ws::hub::ConnectionSender;
use crate::ws::protocol::{ClientMessage, ServerMessage};

/// Serialize a push and queue it on the originating connection, bypassing
/// the hub. Used for direct replies and inline errors.
pub fn push(tx: &ConnectionSender, msg: &ServerMessage) {
    if let Ok(text) = serde_json::to_string(msg) {
        let _ = tx.send(Message::Text(text.into()));
    }
}

/// Queue an inline error push on the originating connection.
pub fn push_error(tx: &ConnectionSender, msg: &str) {
    push(
        tx,
        &ServerMessage::Error {
            msg: msg.to_string(),
        },
    );
}

/// Timestamp attached to event pushes: local time, second precision.
fn now_str() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Dispatch one decoded message from `username`'s connection.
pub async fn dispatch(
    msg: ClientMessage,
    tx: &ConnectionSender,
    state: &AppState,
    username: &str,
) {
    match msg {
        ClientMessage::SendMessage { to, content } => {
            handle_send_message(to, content, tx, state, username).await;
        }
        ClientMessage::SendGroupMessage { group_id, content } => {
            handle_send_group_message(group_id, content, tx, state, username).await;
        }
        ClientMessage::History { with } => {
            handle_history(with, tx, state, username).await;
        }
        ClientMessage::HistoryGroup { group_id } => {
            handle_history_group(group_id, tx, state, username).await;
        }
        ClientMessage::Typing { to, group_id } => {
            handle_typing(to, group_id, tx, state, username).await;
        }
    }
}

async fn handle_send_message(
    to: String,
    content: String,
    tx: &ConnectionSender,
    state: &AppState,
    username: &str,
) {
    if to.is_empty() || content.is_empty() {
        push_error(tx, "to and content must not be empty");
        return;
    }

    let db = state.db.clone();
    let sender = username.to_string();
    let (to_task, content_task) = (to.clone(), content.clone());
    let stored = tokio::task::spawn_blocking(move || {
        messages::insert_private_message(&db, &sender, &to_task, &content_task)
    })
    .await;

    match stored {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(
                from = %username,
                to = %to,
                error = %e,
                "Failed to store private message"
            );
            push_error(tx, "failed to store message, check that the target user exists");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "Store task failed");
            push_error(tx, "internal server error");
            return;
        }
    }

    // Push to every connection of the recipient, and echo the identical
    // push to the sender for multi-device sync.
    let push_msg = ServerMessage::NewMessage {
        from: username.to_string(),
        content,
        ts: now_str(),
    };
    state.hub.send_to_user(&to, &push_msg);
    state.hub.send_to_user(username, &push_msg);
}

async fn handle_send_group_message(
    group_id: i64,
    content: String,
    tx: &ConnectionSender,
    state: &AppState,
    username: &str,
) {
    if group_id == 0 || content.is_empty() {
        push_error(tx, "group_id and content must not be empty");
        return;
    }

    let db = state.db.clone();
    let sender = username.to_string();
    let content_task = content.clone();
    let stored = tokio::task::spawn_blocking(move || {
        messages::insert_group_message(&db, &sender, group_id, &content_task)
    })
    .await;

    match stored {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(
                from = %username,
                group_id,
                error = %e,
                "Failed to store group message"
            );
            push_error(tx, "failed to store group message");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "Store task failed");
            push_error(tx, "internal server error");
            return;
        }
    }

    let db = state.db.clone();
    let members = tokio::task::spawn_blocking(move || groups::group_members(&db, group_id)).await;
    let members = match members {
        Ok(Ok(members)) => members,
        Ok(Err(e)) => {
            tracing::warn!(group_id, error = %e, "Failed to fetch group members");
            push_error(tx, "failed to deliver group message");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "Member query task failed");
            push_error(tx, "internal server error");
            return;
        }
    };

    let push_msg = ServerMessage::NewGroupMessage {
        group_id,
        from: username.to_string(),
        content,
        ts: now_str(),
    };
    // Every member gets the push, the sender included (multi-device sync).
    for member in &members {
        state.hub.send_to_user(member, &push_msg);
    }
}

async fn handle_history(with: String, tx: &ConnectionSender, state: &AppState, username: &str) {
    if with.is_empty() {
        push_error(tx, "with must not be empty");
        return;
    }

    let db = state.db.clone();
    let me = username.to_string();
    let with_task = with.clone();
    let result =
        tokio::task::spawn_blocking(move || messages::private_history(&db, &me, &with_task)).await;

    match result {
        Ok(Ok(history)) => {
            // A reply, not an event: only the asking connection gets it.
            push(
                tx,
                &ServerMessage::History {
                    with,
                    messages: history,
                },
            );
        }
        Ok(Err(e)) => {
            tracing::warn!(user = %username, with = %with, error = %e, "History query failed");
            push_error(tx, "failed to query history");
        }
        Err(e) => {
            tracing::error!(error = %e, "History task failed");
            push_error(tx, "internal server error");
        }
    }
}

async fn handle_history_group(
    group_id: i64,
    tx: &ConnectionSender,
    state: &AppState,
    username: &str,
) {
    if group_id == 0 {
        push_error(tx, "group_id must not be empty");
        return;
    }

    // Membership gate before any history rows are read. A failed check and
    // a non-member look identical to the client.
    let db = state.db.clone();
    let me = username.to_string();
    let membership =
        tokio::task::spawn_blocking(move || groups::is_member(&db, &me, group_id)).await;
    let is_member = match membership {
        Ok(Ok(is_member)) => is_member,
        Ok(Err(e)) => {
            tracing::warn!(user = %username, group_id, error = %e, "Membership check failed");
            false
        }
        Err(e) => {
            tracing::error!(error = %e, "Membership task failed");
            false
        }
    };
    if !is_member {
        push_error(tx, "no permission to access this group's history");
        return;
    }

    let db = state.db.clone();
    let result = tokio::task::spawn_blocking(move || messages::group_history(&db, group_id)).await;

    match result {
        Ok(Ok(history)) => {
            push(
                tx,
                &ServerMessage::HistoryGroup {
                    group_id,
                    messages: history,
                },
            );
        }
        Ok(Err(e)) => {
            tracing::warn!(group_id, error = %e, "Group history query failed");
            push_error(tx, "failed to query group history");
        }
        Err(e) => {
            tracing::error!(error = %e, "Group history task failed");
            push_error(tx, "internal server error");
        }
    }
}

async fn handle_typing(
    to: Option<String>,
    group_id: Option<i64>,
    tx: &ConnectionSender,
    state: &AppState,
    username: &str,
) {
    match (to, group_id) {
        // Private typing: ephemeral, no persistence, no echo.
        (Some(to), None) if !to.is_empty() => {
            state.hub.send_to_user(
                &to,
                &ServerMessage::UserTyping {
                    from: username.to_string(),
                    group_id: None,
                },
            );
        }
        (None, Some(group_id)) if group_id != 0 => {
            // Non-members (and failed lookups) are dropped without any
            // reply, so the indicator cannot probe group membership.
            let db = state.db.clone();
            let me = username.to_string();
            let membership =
                tokio::task::spawn_blocking(move || groups::is_member(&db, &me, group_id)).await;
            match membership {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return,
                Ok(Err(e)) => {
                    tracing::warn!(user = %username, group_id, error = %e, "Membership check failed");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Membership task failed");
                    return;
                }
            }

            let db = state.db.clone();
            let members =
                tokio::task::spawn_blocking(move || groups::group_members(&db, group_id)).await;
            let members = match members {
                Ok(Ok(members)) => members,
                Ok(Err(e)) => {
                    tracing::warn!(group_id, error = %e, "Failed to fetch group members");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Member query task failed");
                    return;
                }
            };

            let push_msg = ServerMessage::UserTyping {
                from: username.to_string(),
                group_id: Some(group_id),
            };
            for member in members.iter().filter(|m| m.as_str() != username) {
                state.hub.send_to_user(member, &push_msg);
            }
        }
        _ => {
            push_error(tx, "typing requires exactly one of to or group_id");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;
    use crate::db::init_test_db;
    use crate::ws::hub::{Hub, Registration};

    fn test_state() -> AppState {
        AppState {
            db: init_test_db(),
            jwt_secret: vec![0; 32],
            hub: Arc::new(Hub::new()),
        }
    }

    fn seed_user(state: &AppState, username: &str) {
        let conn = state.db.lock().unwrap();
        conn.execute(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?1, 'x', ?2)",
            rusqlite::params![username, chrono::Utc::now().to_rfc3339()],
        )
        .unwrap();
    }

    fn seed_group(state: &AppState, creator: &str, members: &[&str]) -> i64 {
        let group_id = groups::create_group(&state.db, "team", creator).unwrap();
        for member in members {
            groups::add_member(&state.db, group_id, member).unwrap();
        }
        group_id
    }

    /// A mock connection: a registered channel whose receiver the test holds.
    fn connect(state: &AppState, username: &str) -> (Registration, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = state.hub.register(username, tx);
        (registration, rx)
    }

    fn sender_of(state: &AppState, username: &str) -> (Registration, ConnectionSender, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registration = state.hub.register(username, tx.clone());
        (registration, tx, rx)
    }

    fn next_push(rx: &mut UnboundedReceiver<Message>) -> Value {
        let msg = rx.try_recv().expect("expected a push");
        match msg {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn message_count(state: &AppState) -> i64 {
        let conn = state.db.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn send_message_persists_once_and_delivers_twice() {
        let state = test_state();
        seed_user(&state, "alice");
        seed_user(&state, "bob");
        let (_ra, tx_alice, mut rx_alice) = sender_of(&state, "alice");
        let (_rb, mut rx_bob) = connect(&state, "bob");

        dispatch(
            ClientMessage::SendMessage {
                to: "bob".to_string(),
                content: "hi bob".to_string(),
            },
            &tx_alice,
            &state,
            "alice",
        )
        .await;

        assert_eq!(message_count(&state), 1);

        let to_bob = next_push(&mut rx_bob);
        let echo = next_push(&mut rx_alice);
        assert_eq!(to_bob["type"], "new_message");
        assert_eq!(to_bob["from"], "alice");
        assert_eq!(to_bob["content"], "hi bob");
        assert_eq!(to_bob, echo, "sender echo must be identical");
        assert!(rx_bob.try_recv().is_err(), "exactly one push per connection");
    }

    #[tokio::test]
    async fn empty_content_is_rejected_before_persistence() {
        let state = test_state();
        seed_user(&state, "alice");
        seed_user(&state, "bob");
        let (_ra, tx_alice, mut rx_alice) = sender_of(&state, "alice");
        let (_rb, mut rx_bob) = connect(&state, "bob");

        dispatch(
            ClientMessage::SendMessage {
                to: "bob".to_string(),
                content: String::new(),
            },
            &tx_alice,
            &state,
            "alice",
        )
        .await;

        assert_eq!(message_count(&state), 0);
        let err = next_push(&mut rx_alice);
        assert_eq!(err["type"], "error");
        assert!(rx_alice.try_recv().is_err());
        assert!(rx_bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_unknown_user_reports_an_inline_error() {
        let state = test_state();
        seed_user(&state, "alice");
        let (_ra, tx_alice, mut rx_alice) = sender_of(&state, "alice");

        dispatch(
            ClientMessage::SendMessage {
                to: "ghost".to_string(),
                content: "anyone there?".to_string(),
            },
            &tx_alice,
            &state,
            "alice",
        )
        .await;

        assert_eq!(message_count(&state), 0);
        let err = next_push(&mut rx_alice);
        assert_eq!(err["type"], "error");
    }

    #[tokio::test]
    async fn group_message_fans_out_to_every_member_including_sender() {
        let state = test_state();
        for user in ["alice", "bob", "carol", "dave"] {
            seed_user(&state, user);
        }
        let group_id = seed_group(&state, "alice", &["bob", "carol"]);
        let (_ra, tx_alice, mut rx_alice) = sender_of(&state, "alice");
        let (_rb, mut rx_bob) = connect(&state, "bob");
        let (_rc, mut rx_carol) = connect(&state, "carol");
        let (_rd, mut rx_dave) = connect(&state, "dave");

        dispatch(
            ClientMessage::SendGroupMessage {
                group_id,
                content: "standup time".to_string(),
            },
            &tx_alice,
            &state,
            "alice",
        )
        .await;

        assert_eq!(message_count(&state), 1);
        for rx in [&mut rx_alice, &mut rx_bob, &mut rx_carol] {
            let push = next_push(rx);
            assert_eq!(push["type"], "new_group_message");
            assert_eq!(push["group_id"], group_id);
            assert_eq!(push["from"], "alice");
        }
        assert!(rx_dave.try_recv().is_err(), "non-members get nothing");
    }

    #[tokio::test]
    async fn history_is_a_single_reply_to_the_asking_connection() {
        let state = test_state();
        seed_user(&state, "alice");
        seed_user(&state, "bob");
        messages::insert_private_message(&state.db, "alice", "bob", "one").unwrap();
        messages::insert_private_message(&state.db, "bob", "alice", "two").unwrap();
        let (_ra, tx_alice, mut rx_alice) = sender_of(&state, "alice");
        let (_rb, mut rx_bob) = connect(&state, "bob");

        dispatch(
            ClientMessage::History {
                with: "bob".to_string(),
            },
            &tx_alice,
            &state,
            "alice",
        )
        .await;

        let reply = next_push(&mut rx_alice);
        assert_eq!(reply["type"], "history");
        assert_eq!(reply["with"], "bob");
        let history = reply["messages"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["content"], "one");
        assert!(rx_bob.try_recv().is_err(), "history is not broadcast");
    }

    #[tokio::test]
    async fn group_history_is_denied_to_non_members() {
        let state = test_state();
        seed_user(&state, "alice");
        seed_user(&state, "bob");
        let group_id = seed_group(&state, "bob", &[]);
        messages::insert_group_message(&state.db, "bob", group_id, "secret").unwrap();
        let (_ra, tx_alice, mut rx_alice) = sender_of(&state, "alice");

        dispatch(
            ClientMessage::HistoryGroup { group_id },
            &tx_alice,
            &state,
            "alice",
        )
        .await;

        let reply = next_push(&mut rx_alice);
        assert_eq!(reply["type"], "error");
        assert!(
            reply["msg"].as_str().unwrap().contains("permission"),
            "denial must not leak history data"
        );
        assert!(rx_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn group_history_returns_rows_to_members() {
        let state = test_state();
        seed_user(&state, "alice");
        seed_user(&state, "bob");
        let group_id = seed_group(&state, "alice", &["bob"]);
        messages::insert_group_message(&state.db, "alice", group_id, "hello").unwrap();
        let (_rb, tx_bob, mut rx_bob) = sender_of(&state, "bob");

        dispatch(
            ClientMessage::HistoryGroup { group_id },
            &tx_bob,
            &state,
            "bob",
        )
        .await;

        let reply = next_push(&mut rx_bob);
        assert_eq!(reply["type"], "history_group");
        assert_eq!(reply["group_id"], group_id);
        assert_eq!(reply["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn private_typing_reaches_only_the_target() {
        let state = test_state();
        seed_user(&state, "alice");
        seed_user(&state, "bob");
        let (_ra, tx_alice, mut rx_alice) = sender_of(&state, "alice");
        let (_rb, mut rx_bob) = connect(&state, "bob");

        dispatch(
            ClientMessage::Typing {
                to: Some("bob".to_string()),
                group_id: None,
            },
            &tx_alice,
            &state,
            "alice",
        )
        .await;

        let push = next_push(&mut rx_bob);
        assert_eq!(push["type"], "user_typing");
        assert_eq!(push["from"], "alice");
        assert!(push.get("group_id").is_none());
        assert!(rx_alice.try_recv().is_err(), "typing is never echoed");
    }

    #[tokio::test]
    async fn group_typing_skips_the_sender() {
        let state = test_state();
        seed_user(&state, "alice");
        seed_user(&state, "bob");
        let group_id = seed_group(&state, "alice", &["bob"]);
        let (_ra, tx_alice, mut rx_alice) = sender_of(&state, "alice");
        let (_rb, mut rx_bob) = connect(&state, "bob");

        dispatch(
            ClientMessage::Typing {
                to: None,
                group_id: Some(group_id),
            },
            &tx_alice,
            &state,
            "alice",
        )
        .await;

        let push = next_push(&mut rx_bob);
        assert_eq!(push["type"], "user_typing");
        assert_eq!(push["group_id"], group_id);
        assert!(rx_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn group_typing_from_non_member_is_completely_silent() {
        let state = test_state();
        seed_user(&state, "alice");
        seed_user(&state, "bob");
        let group_id = seed_group(&state, "bob", &[]);
        let (_ra, tx_alice, mut rx_alice) = sender_of(&state, "alice");
        let (_rb, mut rx_bob) = connect(&state, "bob");

        dispatch(
            ClientMessage::Typing {
                to: None,
                group_id: Some(group_id),
            },
            &tx_alice,
            &state,
            "alice",
        )
        .await;

        assert!(rx_alice.try_recv().is_err(), "no error push");
        assert!(rx_bob.try_recv().is_err(), "no typing push");
    }

    #[tokio::test]
    async fn typing_with_both_targets_is_a_validation_error() {
        let state = test_state();
        seed_user(&state, "alice");
        let (_ra, tx_alice, mut rx_alice) = sender_of(&state, "alice");

        dispatch(
            ClientMessage::Typing {
                to: Some("bob".to_string()),
                group_id: Some(1),
            },
            &tx_alice,
            &state,
            "alice",
        )
        .await;

        let err = next_push(&mut rx_alice);
        assert_eq!(err["type"], "error");
    }
}
