use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::task::spawn_blocking;
use tracing::{error, info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::{GatewayCommand, GatewayEvent};
use parley_types::models::MessageStatus;

use crate::presence::Presence;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated WebSocket connection. The token was already
/// validated at the HTTP upgrade layer, so the session starts with Ready
/// and goes straight into the event loop.
pub async fn handle_connection(
    socket: WebSocket,
    presence: Presence,
    db: Arc<Database>,
    user_id: Uuid,
    username: String,
) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Subscribe before registering so this connection also receives the
    // online-users broadcast announcing itself.
    let mut broadcast_rx = presence.subscribe();
    let (conn_id, mut user_rx) = presence.register(user_id).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events to the client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client.
    let presence_recv = presence.clone();
    let db_recv = db.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&presence_recv, &db_recv, user_id, cmd).await;
                    }
                    Err(e) => {
                        let raw = text.as_str();
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            &raw[..raw.len().min(200)]
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Guarded by the conn_id captured at registration: if the user already
    // reconnected, this removes nothing.
    presence.unregister(user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

/// Dispatch one inbound command. Command failures are logged and never
/// tear down the connection.
pub async fn handle_command(
    presence: &Presence,
    db: &Arc<Database>,
    user_id: Uuid,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Typing {
            receiver_id,
            is_typing,
        } => {
            // Pure relay: no persistence, dropped when the peer is offline.
            presence
                .send_to_user(
                    receiver_id,
                    GatewayEvent::Typing {
                        sender_id: user_id,
                        is_typing,
                    },
                )
                .await;
        }

        GatewayCommand::MarkConversationRead {
            sender_id,
            receiver_id,
        } => {
            let db = db.clone();
            let changed = match spawn_blocking(move || {
                db.mark_conversation_read(&sender_id.to_string(), &receiver_id.to_string())
            })
            .await
            {
                Ok(Ok(changed)) => changed,
                Ok(Err(e)) => {
                    error!("conversation read update failed: {e:#}");
                    return;
                }
                Err(e) => {
                    error!("spawn_blocking join error: {e}");
                    return;
                }
            };

            // Idempotent: reapplying to an already-read conversation changes
            // nothing and pushes nothing.
            if changed == 0 {
                return;
            }

            presence
                .send_to_user(
                    sender_id,
                    GatewayEvent::ConversationRead {
                        partner_id: receiver_id,
                        status: MessageStatus::Read,
                    },
                )
                .await;
            presence
                .send_to_user(
                    receiver_id,
                    GatewayEvent::ConversationRead {
                        partner_id: sender_id,
                        status: MessageStatus::Read,
                    },
                )
                .await;
        }
    }
}
