use axum::{Extension, Json, extract::State};
use tracing::warn;
use uuid::Uuid;

use parley_db::models::UserRow;
use parley_types::api::Claims;
use parley_types::models::User;

use crate::auth::AppState;
use crate::error::ApiError;

/// Directory listing for the conversation sidebar: everyone except the
/// requester, without credential fields.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<User>>, ApiError> {
    let db = state.db.clone();
    let me = claims.sub.to_string();
    let rows = tokio::task::spawn_blocking(move || db.list_users_excluding(&me))
        .await
        .map_err(anyhow::Error::from)??;

    Ok(Json(rows.into_iter().map(user_from_row).collect()))
}

fn user_from_row(row: UserRow) -> User {
    User {
        id: row.id.parse().unwrap_or_else(|e| {
            warn!("Corrupt user id '{}': {}", row.id, e);
            Uuid::default()
        }),
        username: row.username,
        created_at: crate::messages::parse_timestamp(&row.created_at, &row.id),
    }
}
