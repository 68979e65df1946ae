use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_api::auth::{self, AppState, AppStateInner};
use parley_api::error::ApiError;
use parley_api::media::MediaStore;
use parley_api::messages;
use parley_api::middleware::{require_auth, verify_token};
use parley_api::users;
use parley_gateway::connection;
use parley_gateway::presence::Presence;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into());
    let media_dir = std::env::var("PARLEY_MEDIA_DIR").unwrap_or_else(|_| "media".into());
    let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLEY_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let public_url = std::env::var("PARLEY_PUBLIC_URL")
        .unwrap_or_else(|_| format!("http://localhost:{port}"));

    // Shared state
    let db = Arc::new(parley_db::Database::open(&PathBuf::from(&db_path))?);
    let presence = Presence::new();
    let media = MediaStore::new(PathBuf::from(&media_dir), public_url).await?;

    let state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret,
        presence,
        media,
    });

    let app = build_app(state, &media_dir);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_app(state: AppState, media_dir: &str) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/users", get(users::list_users))
        .route("/messages/{peer_id}", get(messages::get_conversation))
        .route("/messages/{peer_id}", post(messages::send_message))
        .route("/messages/{peer_id}/read", post(messages::mark_read))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .nest_service("/media", ServeDir::new(media_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct GatewayParams {
    token: String,
}

/// The token is validated here at the upgrade layer, so the gateway
/// receives only pre-authenticated connections.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<GatewayParams>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let claims = verify_token(&state.jwt_secret, &params.token)?;

    let presence = state.presence.clone();
    let db = state.db.clone();
    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, presence, db, claims.sub, claims.username)
    }))
}
