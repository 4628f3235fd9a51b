use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::state::AppState;
use crate::ws::dispatch;
use crate::ws::protocol::{self, DecodeError};

/// Ping interval: server sends WebSocket ping every 30 seconds.
/// Detects dead transports behind NATs that drop idle mappings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the per-connection session for an authenticated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - This task: registers with the hub, reads incoming messages, and feeds
///   them to the dispatcher until close or transport error
///
/// The mpsc channel allows any part of the system (hub fanout, inline error
/// pushes) to send messages to this client by cloning the sender. The hub
/// registration is a guard, so the connection is unregistered on every exit
/// path exactly once.
pub async fn run_connection(socket: WebSocket, state: AppState, username: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let registration = state.hub.register(&username, tx.clone());

    tracing::info!(
        username = %username,
        connections = state.hub.connection_count(&username),
        "Session started"
    );

    // Spawn writer task: forwards mpsc messages to the WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Reader loop: process incoming WebSocket messages
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => match protocol::decode(text.as_str()) {
                    Ok(inbound) => {
                        dispatch::dispatch(inbound, &tx, &state, &username).await;
                    }
                    Err(err @ DecodeError::Json(_)) => {
                        // Unreadable frame: the peer is not speaking the
                        // protocol, treat like a transport error.
                        tracing::warn!(
                            username = %username,
                            error = %err,
                            "Undecodable frame, closing session"
                        );
                        break;
                    }
                    Err(err) => {
                        tracing::debug!(username = %username, error = %err, "Rejected message");
                        dispatch::push_error(&tx, &err.client_message());
                    }
                },
                Message::Binary(_) => {
                    // The protocol is JSON text; tolerate stray binary frames.
                    tracing::debug!(username = %username, "Ignoring binary frame");
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        username = %username,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    username = %username,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(username = %username, "WebSocket stream ended");
                break;
            }
        }
    }

    // Cleanup: abort writer and ping tasks, release the hub entry
    writer_handle.abort();
    ping_handle.abort();
    drop(registration);

    tracing::info!(username = %username, "Session ended");
}

/// Writer task: receives messages from the mpsc channel and forwards them to
/// the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}
