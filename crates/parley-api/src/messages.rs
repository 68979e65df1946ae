use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;
use uuid::Uuid;

use parley_db::models::MessageRow;
use parley_types::api::{Claims, MarkReadResponse, SendMessageRequest};
use parley_types::events::GatewayEvent;
use parley_types::models::{Message, MessageStatus, ReadReceipt};

use crate::auth::AppState;
use crate::error::ApiError;

/// Full two-direction conversation with a peer, oldest first, each message
/// carrying its receipt trail (batch-fetched, no per-message query).
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let db = state.db.clone();
    let (me, peer) = (claims.sub.to_string(), peer_id.to_string());

    let (rows, read_rows) = tokio::task::spawn_blocking(move || {
        let rows = db.get_conversation(&me, &peer)?;
        let message_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let read_rows = db.get_reads_for_messages(&message_ids)?;
        Ok::<_, anyhow::Error>((rows, read_rows))
    })
    .await
    .map_err(anyhow::Error::from)??;

    // Group receipts by message_id (cheap in-memory work, fine on the async thread)
    let mut read_map: HashMap<String, Vec<ReadReceipt>> = HashMap::new();
    for r in read_rows {
        let receipt = ReadReceipt {
            user_id: r.user_id.parse().unwrap_or_else(|e| {
                warn!("Corrupt user_id '{}' on receipt for '{}': {}", r.user_id, r.message_id, e);
                Uuid::default()
            }),
            read_at: parse_timestamp(&r.read_at, &r.message_id),
        };
        read_map.entry(r.message_id).or_default().push(receipt);
    }

    let messages = rows
        .into_iter()
        .map(|row| {
            let read_by = read_map.remove(&row.id).unwrap_or_default();
            message_from_row(row, read_by)
        })
        .collect();

    Ok(Json(messages))
}

/// Persist and route a new message. Validation and the media upload happen
/// before any store mutation, so a failure in either leaves no trace. The
/// push to the receiver is attempted only if they are online; the persisted
/// message is returned to the sender either way.
pub async fn send_message(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let text = req
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from);
    let image = req.image.as_deref().filter(|i| !i.is_empty());

    if text.is_none() && image.is_none() {
        return Err(ApiError::Validation(
            "message must contain text or an image".into(),
        ));
    }

    // The receiver must be a known user. Being offline is fine.
    let db = state.db.clone();
    let receiver = peer_id.to_string();
    tokio::task::spawn_blocking(move || db.get_user_by_id(&receiver))
        .await
        .map_err(anyhow::Error::from)??
        .ok_or(ApiError::NotFound("user"))?;

    let image_url = match image {
        Some(payload) => Some(state.media.store_image(payload).await?),
        None => None,
    };

    let message_id = Uuid::new_v4();
    let created_at = Utc::now();

    let db = state.db.clone();
    let (mid, sid, rid) = (
        message_id.to_string(),
        claims.sub.to_string(),
        peer_id.to_string(),
    );
    let (text_db, url_db) = (text.clone(), image_url.clone());
    let ts = created_at.to_rfc3339_opts(SecondsFormat::Millis, true);
    tokio::task::spawn_blocking(move || {
        db.insert_message(&mid, &sid, &rid, text_db.as_deref(), url_db.as_deref(), &ts)
    })
    .await
    .map_err(anyhow::Error::from)??;

    let message = Message {
        id: message_id,
        sender_id: claims.sub,
        receiver_id: peer_id,
        text,
        image_url,
        status: MessageStatus::Sent,
        created_at,
        read_by: vec![],
    };

    state
        .presence
        .send_to_user(
            peer_id,
            GatewayEvent::NewMessage {
                message: message.clone(),
            },
        )
        .await;

    Ok((StatusCode::CREATED, Json(message)))
}

/// Fine-grained mark-read: the caller viewed the messages `peer_id` sent
/// them. Pushes a receipt to the original sender only when something
/// actually changed; always answers with the updated count.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let db = state.db.clone();
    let (sender, viewer) = (peer_id.to_string(), claims.sub.to_string());
    let read_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    let updated_count =
        tokio::task::spawn_blocking(move || db.mark_read(&sender, &viewer, &read_at))
            .await
            .map_err(anyhow::Error::from)??;

    if updated_count > 0 {
        state
            .presence
            .send_to_user(
                peer_id,
                GatewayEvent::MessageRead {
                    reader_id: claims.sub,
                    updated_count,
                },
            )
            .await;
    }

    Ok(Json(MarkReadResponse { updated_count }))
}

fn message_from_row(row: MessageRow, read_by: Vec<ReadReceipt>) -> Message {
    let status = MessageStatus::parse(&row.status).unwrap_or_else(|| {
        warn!("Corrupt status '{}' on message '{}'", row.status, row.id);
        MessageStatus::Sent
    });

    Message {
        id: row.id.parse().unwrap_or_else(|e| {
            warn!("Corrupt message id '{}': {}", row.id, e);
            Uuid::default()
        }),
        sender_id: row.sender_id.parse().unwrap_or_else(|e| {
            warn!("Corrupt sender_id '{}' on message '{}': {}", row.sender_id, row.id, e);
            Uuid::default()
        }),
        receiver_id: row.receiver_id.parse().unwrap_or_else(|e| {
            warn!("Corrupt receiver_id '{}' on message '{}': {}", row.receiver_id, row.id, e);
            Uuid::default()
        }),
        text: row.text,
        image_url: row.image_url,
        status,
        created_at: parse_timestamp(&row.created_at, &row.id),
        read_by,
    }
}

/// SQLite default timestamps come back as "YYYY-MM-DD HH:MM:SS" without a
/// timezone; rows written by this server carry RFC 3339. Accept both.
pub(crate) fn parse_timestamp(raw: &str, row_id: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}' on row '{}': {}", raw, row_id, e);
            DateTime::default()
        })
}
