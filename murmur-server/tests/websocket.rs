//! End-to-end tests over a real listener: WebSocket chat and the REST API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use murmur_server::auth::TokenVerifier;
use murmur_server::config::ServerConfig;
use murmur_server::protocol::Identity;
use murmur_server::server::{Server, SharedState};
use murmur_server::store::{MessageStore, SqliteStore};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const TIMEOUT: Duration = Duration::from_secs(5);
const SECRET: &str = "websocket-test-secret";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: Arc<SharedState>,
    store: Arc<SqliteStore>,
    issuer: TokenVerifier,
}

impl TestServer {
    fn token(&self, user_id: &str) -> String {
        self.issuer.issue(user_id, chrono::Duration::hours(1))
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn connect(&self, token: &str) -> Ws {
        let url = format!("ws://{}/ws?token={token}", self.addr);
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws
    }

    async fn connect_with_header(&self, token: &str) -> Ws {
        let mut request = format!("ws://{}/ws", self.addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {token}").parse().unwrap());
        let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        ws
    }

    /// Connect, join, and wait for the join to complete.
    async fn join(&self, user_id: &str) -> (Ws, Value) {
        let mut ws = self.connect(&self.token(user_id)).await;
        send(&mut ws, json!({"event": "join", "id": user_id})).await;
        let history = wait_event(&mut ws, "messageHistory").await;
        wait_event(&mut ws, "onlineUsers").await;
        (ws, history)
    }
}

async fn start_server() -> TestServer {
    let store = Arc::new(SqliteStore::open_memory().unwrap());
    for (id, name) in [("u1", "Ada"), ("u2", "Grace"), ("u3", "Linus")] {
        store.upsert_identity(&Identity::new(id, name)).unwrap();
    }
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        token_secret: SECRET.to_string(),
        ..Default::default()
    };
    let (addr, state, _handle) = Server::with_store(config, store.clone())
        .start()
        .await
        .unwrap();
    let issuer = TokenVerifier::new(SECRET.as_bytes(), store.clone()).unwrap();
    TestServer {
        addr,
        state,
        store,
        issuer,
    }
}

async fn send(ws: &mut Ws, event: Value) {
    ws.send(WsMessage::Text(event.to_string().into())).await.unwrap();
}

async fn next_event(ws: &mut Ws) -> Value {
    loop {
        let frame = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        match frame {
            WsMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn wait_event(ws: &mut Ws, name: &str) -> Value {
    loop {
        let event = next_event(ws).await;
        if event["event"] == name {
            return event;
        }
    }
}

// ── WebSocket ──────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_round_trip_over_websocket() {
    let server = start_server().await;
    let (mut ada, history) = server.join("u1").await;
    assert_eq!(history["messages"], json!([]));

    let mut grace = server.connect_with_header(&server.token("u2")).await;
    send(&mut grace, json!({"event": "join", "id": "u2"})).await;
    wait_event(&mut grace, "messageHistory").await;
    let online = wait_event(&mut grace, "onlineUsers").await;
    assert_eq!(online["users"][0]["identity"]["id"], "u1");

    send(&mut ada, json!({"event": "sendMessage", "text": "hi", "recipientId": "u2"})).await;
    let sent = wait_event(&mut ada, "message").await;
    let received = wait_event(&mut grace, "message").await;
    assert_eq!(sent["message"]["id"], received["message"]["id"]);
    assert_eq!(received["message"]["text"], "hi");
    assert_eq!(received["message"]["senderDisplayName"], "Ada");
    assert_eq!(received["message"]["recipientId"], "u2");

    send(&mut ada, json!({"event": "typing"})).await;
    let typing = wait_event(&mut grace, "userTyping").await;
    assert_eq!(typing["identity"]["displayName"], "Ada");
}

#[tokio::test]
async fn bad_token_closes_socket_without_events() {
    let server = start_server().await;
    let mut ws = server.connect("not-a-token").await;
    let frame = timeout(TIMEOUT, ws.next())
        .await
        .expect("timed out")
        .expect("socket closed without close frame")
        .unwrap();
    match frame {
        WsMessage::Close(Some(close)) => {
            assert_eq!(close.code, CloseCode::Policy);
            assert_eq!(close.reason.as_str(), "invalid-token");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    assert!(server.state.connections.lock().is_empty());
}

#[tokio::test]
async fn malformed_and_binary_frames() {
    let server = start_server().await;
    let (mut ada, _) = server.join("u1").await;

    ada.send(WsMessage::Text("{not json".into())).await.unwrap();
    assert_eq!(next_event(&mut ada).await, json!({"event": "error", "kind": "malformed-event"}));

    let oversized = "x".repeat(20 * 1024);
    send(&mut ada, json!({"event": "sendMessage", "text": oversized, "recipientId": "u2"})).await;
    assert_eq!(next_event(&mut ada).await["kind"], "malformed-event");

    let binary = json!({"event": "sendMessage", "text": "as bytes", "recipientId": "u1"}).to_string();
    ada.send(WsMessage::Binary(binary.into_bytes().into())).await.unwrap();
    let echoed = wait_event(&mut ada, "message").await;
    assert_eq!(echoed["message"]["text"], "as bytes");
}

#[tokio::test]
async fn client_disconnect_marks_user_offline() {
    let server = start_server().await;
    let (ada, _) = server.join("u1").await;
    let (mut grace, _) = server.join("u2").await;
    drop(ada);

    loop {
        let event = wait_event(&mut grace, "onlineUsers").await;
        if event["users"] == json!([]) {
            break;
        }
    }
    let row = server
        .store
        .list_users()
        .unwrap()
        .into_iter()
        .find(|r| r.identity.id == "u1")
        .unwrap();
    assert!(!row.online);
    assert!(row.last_seen.is_some());
}

// ── REST API ───────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_live_counts() {
    let server = start_server().await;
    let (_ada, _) = server.join("u1").await;

    let health: Value = reqwest::get(server.url("/api/v1/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["connections"], 1);
    assert_eq!(health["joined"], 1);
    assert_eq!(health["onlineUsers"], 1);
}

#[tokio::test]
async fn users_endpoint_requires_token_and_lists_others() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let anonymous = client.get(server.url("/api/v1/users")).send().await.unwrap();
    assert_eq!(anonymous.status(), reqwest::StatusCode::UNAUTHORIZED);

    let (_grace, _) = server.join("u2").await;
    let users: Value = client
        .get(server.url("/api/v1/users"))
        .bearer_auth(server.token("u1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        users,
        json!([
            {"id": "u2", "displayName": "Grace", "online": true, "lastSeen": null},
            {"id": "u3", "displayName": "Linus", "online": false, "lastSeen": null},
        ])
    );
}

#[tokio::test]
async fn messages_endpoint_returns_conversation() {
    let server = start_server().await;
    let ada = Identity::new("u1", "Ada");
    let grace = Identity::new("u2", "Grace");
    let linus = Identity::new("u3", "Linus");
    server.store.append(&ada, &grace, "one").unwrap();
    server.store.append(&linus, &ada, "elsewhere").unwrap();
    let two = server.store.append(&grace, &ada, "two").unwrap();

    let client = reqwest::Client::new();
    let token = server.token("u1");
    let all: Value = client
        .get(server.url("/api/v1/messages/u2"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let texts: Vec<_> = all.as_array().unwrap().iter().map(|m| m["text"].clone()).collect();
    assert_eq!(texts, vec![json!("one"), json!("two")]);

    let latest: Value = client
        .get(server.url("/api/v1/messages/u2?limit=1"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(latest[0]["text"], "two");

    let earlier: Value = client
        .get(server.url(&format!("/api/v1/messages/u2?limit=1&before={}", two.id)))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(earlier.as_array().unwrap().len(), 1);
    assert_eq!(earlier[0]["text"], "one");

    let missing = client
        .get(server.url("/api/v1/messages/ghost"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}
