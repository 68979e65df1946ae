//! End-to-end tests: a real server on an ephemeral port, driven over HTTP
//! with reqwest and over the WebSocket gateway with the client crate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use parley_api::auth::{self, AppState, AppStateInner};
use parley_api::error::ApiError;
use parley_api::media::MediaStore;
use parley_api::messages;
use parley_api::middleware::{require_auth, verify_token};
use parley_api::users;
use parley_client::GatewayClient;
use parley_db::Database;
use parley_gateway::connection;
use parley_gateway::presence::Presence;
use parley_types::api::{MarkReadResponse, RegisterResponse};
use parley_types::events::{GatewayCommand, GatewayEvent};
use parley_types::models::{Message, MessageStatus};

struct TestServer {
    http: String,
    ws: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GatewayParams {
    token: String,
}

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

async fn spawn_server() -> TestServer {
    let media_dir =
        std::env::temp_dir().join(format!("parley_gateway_test_{}", Uuid::new_v4()));

    let state: AppState = Arc::new(AppStateInner {
        db: Arc::new(Database::open_in_memory().unwrap()),
        jwt_secret: "test-secret".into(),
        presence: Presence::new(),
        media: MediaStore::new(PathBuf::from(&media_dir), "http://localhost".into())
            .await
            .unwrap(),
    });

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

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        http: format!("http://{addr}"),
        ws: format!("ws://{addr}"),
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    async fn register(&self, username: &str) -> (Uuid, String) {
        let res = self
            .client
            .post(format!("{}/auth/register", self.http))
            .json(&serde_json::json!({ "username": username, "password": "hunter2hunter2" }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 201);
        let body: RegisterResponse = res.json().await.unwrap();
        (body.user_id, body.token)
    }

    async fn send_text(&self, token: &str, peer: Uuid, text: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/messages/{}", self.http, peer))
            .bearer_auth(token)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .unwrap()
    }

    async fn conversation(&self, token: &str, peer: Uuid) -> Vec<Message> {
        let res = self
            .client
            .get(format!("{}/messages/{}", self.http, peer))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        res.json().await.unwrap()
    }

    async fn connect(&self, token: &str) -> GatewayClient {
        GatewayClient::connect(&self.ws, token).await.unwrap()
    }
}

async fn next_matching(
    client: &mut GatewayClient,
    what: &str,
    pred: impl Fn(&GatewayEvent) -> bool,
) -> GatewayEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = client.next_event().await.expect("gateway closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

#[tokio::test]
async fn message_reaches_connected_receiver_and_store() {
    let server = spawn_server().await;
    let (alice_id, alice_token) = server.register("alice").await;
    let (bob_id, bob_token) = server.register("bob").await;

    let mut bob = server.connect(&bob_token).await;
    next_matching(&mut bob, "ready", |e| matches!(e, GatewayEvent::Ready { .. })).await;

    let res = server.send_text(&alice_token, bob_id, "hi").await;
    assert_eq!(res.status(), 201);
    let sent: Message = res.json().await.unwrap();
    assert_eq!(sent.status, MessageStatus::Sent);
    assert!(sent.read_by.is_empty());

    let pushed = next_matching(&mut bob, "new-message", |e| {
        matches!(e, GatewayEvent::NewMessage { .. })
    })
    .await;
    match pushed {
        GatewayEvent::NewMessage { message } => {
            assert_eq!(message.sender_id, alice_id);
            assert_eq!(message.text.as_deref(), Some("hi"));
            assert_eq!(message.status, MessageStatus::Sent);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let stored = server.conversation(&alice_token, bob_id).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, MessageStatus::Sent);
    assert!(stored[0].read_by.is_empty());
}

#[tokio::test]
async fn message_to_offline_receiver_still_succeeds() {
    let server = spawn_server().await;
    let (_alice_id, alice_token) = server.register("alice").await;
    let (bob_id, _bob_token) = server.register("bob").await;

    let res = server.send_text(&alice_token, bob_id, "you there?").await;
    assert_eq!(res.status(), 201);

    let stored = server.conversation(&alice_token, bob_id).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].text.as_deref(), Some("you there?"));
}

#[tokio::test]
async fn empty_message_is_rejected_with_no_side_effects() {
    let server = spawn_server().await;
    let (_alice_id, alice_token) = server.register("alice").await;
    let (bob_id, _bob_token) = server.register("bob").await;

    let res = server
        .client
        .post(format!("{}/messages/{}", server.http, bob_id))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({ "text": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);

    assert!(server.conversation(&alice_token, bob_id).await.is_empty());
}

#[tokio::test]
async fn failed_image_upload_aborts_the_send_entirely() {
    let server = spawn_server().await;
    let (_alice_id, alice_token) = server.register("alice").await;
    let (bob_id, bob_token) = server.register("bob").await;

    let mut bob = server.connect(&bob_token).await;
    next_matching(&mut bob, "ready", |e| matches!(e, GatewayEvent::Ready { .. })).await;

    let res = server
        .client
        .post(format!("{}/messages/{}", server.http, bob_id))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({
            "text": "look at this",
            "image": "data:image/png;base64,not valid base64!!!"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 502);

    // Nothing was persisted and nothing was pushed.
    assert!(server.conversation(&alice_token, bob_id).await.is_empty());
    assert_no_message_push(&mut bob).await;
}

/// Asserts no message push arrives within a short grace period.
async fn assert_no_message_push(bob: &mut GatewayClient) {
    let quiet = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            match bob.next_event().await {
                Some(GatewayEvent::NewMessage { .. }) => return false,
                Some(_) => continue,
                None => return true,
            }
        }
    })
    .await;
    assert!(!matches!(quiet, Ok(false)), "unexpected new-message push");
}

#[tokio::test]
async fn message_to_unknown_user_is_404() {
    let server = spawn_server().await;
    let (_alice_id, alice_token) = server.register("alice").await;

    let res = server.send_text(&alice_token, Uuid::new_v4(), "hello?").await;
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn mark_read_counts_once_and_notifies_the_sender() {
    let server = spawn_server().await;
    let (alice_id, alice_token) = server.register("alice").await;
    let (bob_id, bob_token) = server.register("bob").await;

    let mut alice = server.connect(&alice_token).await;
    next_matching(&mut alice, "ready", |e| matches!(e, GatewayEvent::Ready { .. })).await;

    assert_eq!(server.send_text(&alice_token, bob_id, "one").await.status(), 201);
    assert_eq!(server.send_text(&alice_token, bob_id, "two").await.status(), 201);

    let mark = |token: String| {
        let client = server.client.clone();
        let url = format!("{}/messages/{}/read", server.http, alice_id);
        async move {
            let res = client.post(url).bearer_auth(token).send().await.unwrap();
            assert_eq!(res.status(), 200);
            res.json::<MarkReadResponse>().await.unwrap().updated_count
        }
    };

    assert_eq!(mark(bob_token.clone()).await, 2);

    let receipt = next_matching(&mut alice, "message-read", |e| {
        matches!(e, GatewayEvent::MessageRead { .. })
    })
    .await;
    match receipt {
        GatewayEvent::MessageRead {
            reader_id,
            updated_count,
        } => {
            assert_eq!(reader_id, bob_id);
            assert_eq!(updated_count, 2);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Second application finds nothing left to change.
    assert_eq!(mark(bob_token).await, 0);

    let stored = server.conversation(&alice_token, bob_id).await;
    assert!(stored.iter().all(|m| m.status == MessageStatus::Read));
    assert!(stored.iter().all(|m| m.read_by.len() == 1));
}

#[tokio::test]
async fn typing_is_relayed_to_the_peer() {
    let server = spawn_server().await;
    let (alice_id, alice_token) = server.register("alice").await;
    let (bob_id, bob_token) = server.register("bob").await;

    let alice = server.connect(&alice_token).await;
    let mut bob = server.connect(&bob_token).await;
    next_matching(&mut bob, "ready", |e| matches!(e, GatewayEvent::Ready { .. })).await;

    alice
        .commands()
        .send(GatewayCommand::Typing {
            receiver_id: bob_id,
            is_typing: true,
        })
        .unwrap();

    let event = next_matching(&mut bob, "typing", |e| {
        matches!(e, GatewayEvent::Typing { .. })
    })
    .await;
    match event {
        GatewayEvent::Typing {
            sender_id,
            is_typing,
        } => {
            assert_eq!(sender_id, alice_id);
            assert!(is_typing);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn conversation_read_updates_store_and_notifies_both_parties() {
    let server = spawn_server().await;
    let (alice_id, alice_token) = server.register("alice").await;
    let (bob_id, bob_token) = server.register("bob").await;

    let mut alice = server.connect(&alice_token).await;
    let mut bob = server.connect(&bob_token).await;
    next_matching(&mut alice, "ready", |e| matches!(e, GatewayEvent::Ready { .. })).await;
    next_matching(&mut bob, "ready", |e| matches!(e, GatewayEvent::Ready { .. })).await;

    assert_eq!(server.send_text(&alice_token, bob_id, "hi").await.status(), 201);

    bob.commands()
        .send(GatewayCommand::MarkConversationRead {
            sender_id: alice_id,
            receiver_id: bob_id,
        })
        .unwrap();

    let to_alice = next_matching(&mut alice, "conversation-read", |e| {
        matches!(e, GatewayEvent::ConversationRead { .. })
    })
    .await;
    match to_alice {
        GatewayEvent::ConversationRead { partner_id, status } => {
            assert_eq!(partner_id, bob_id);
            assert_eq!(status, MessageStatus::Read);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let to_bob = next_matching(&mut bob, "conversation-read", |e| {
        matches!(e, GatewayEvent::ConversationRead { .. })
    })
    .await;
    match to_bob {
        GatewayEvent::ConversationRead { partner_id, .. } => assert_eq!(partner_id, alice_id),
        other => panic!("unexpected event: {other:?}"),
    }

    let stored = server.conversation(&alice_token, bob_id).await;
    assert!(stored.iter().all(|m| m.status == MessageStatus::Read));
}

#[tokio::test]
async fn connecting_broadcasts_online_users_to_everyone() {
    let server = spawn_server().await;
    let (alice_id, alice_token) = server.register("alice").await;
    let (bob_id, bob_token) = server.register("bob").await;

    let mut alice = server.connect(&alice_token).await;
    next_matching(&mut alice, "own online-users", |e| {
        matches!(e, GatewayEvent::OnlineUsers { user_ids } if user_ids.contains(&alice_id))
    })
    .await;

    let _bob = server.connect(&bob_token).await;
    next_matching(&mut alice, "updated online-users", |e| {
        matches!(e, GatewayEvent::OnlineUsers { user_ids } if user_ids.contains(&bob_id))
    })
    .await;
}

#[tokio::test]
async fn requests_without_token_are_unauthorized() {
    let server = spawn_server().await;
    let (_alice_id, _alice_token) = server.register("alice").await;

    let res = server
        .client
        .get(format!("{}/users", server.http))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let res = server
        .client
        .get(format!("{}/users", server.http))
        .bearer_auth("not-a-token")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    // A bad gateway token is refused before the upgrade completes.
    assert!(GatewayClient::connect(&server.ws, "not-a-token").await.is_err());
}

#[tokio::test]
async fn user_directory_excludes_the_requester() {
    let server = spawn_server().await;
    let (_alice_id, alice_token) = server.register("alice").await;
    let (bob_id, _bob_token) = server.register("bob").await;

    let res = server
        .client
        .get(format!("{}/users", server.http))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let listed: Vec<parley_types::models::User> = res.json().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, bob_id);
    assert_eq!(listed[0].username, "bob");
}
