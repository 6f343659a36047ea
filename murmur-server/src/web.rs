//! HTTP surface: the WebSocket endpoint and a small read-only REST API.
//!
//! Endpoints:
//! - `GET /ws`: the chat socket. Token in `?token=` or `Authorization: Bearer`.
//! - `GET /api/v1/health`: process status, no auth.
//! - `GET /api/v1/users`: directory with live presence.
//! - `GET /api/v1/messages/{user_id}`: conversation with one user.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket, close_code};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::auth::bearer_token;
use crate::config::ServerConfig;
use crate::connection::{self, Inbound};
use crate::protocol::{ClientEvent, Identity, Message, ServerEvent};
use crate::server::SharedState;

/// Frames larger than this are answered with `malformed-event`.
pub const MAX_FRAME_LEN: usize = 16 * 1024;

/// Decoded frames buffered between the socket and the connection task.
const INBOUND_QUEUE: usize = 64;

/// Upper bound on REST conversation page size.
const MAX_PAGE: usize = 500;

const WS_SEND_TIMEOUT: Duration = Duration::from_secs(30);

type ApiError = (StatusCode, String);

// ── Router ─────────────────────────────────────────────────────────────

pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/v1/health", get(api_health))
        .route("/api/v1/users", get(api_users))
        .route("/api/v1/messages/{user_id}", get(api_messages))
        .layer(cors_layer(&state.config))
        .with_state(state)
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    match config.cors_origin.as_deref() {
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(origin) => layer.allow_origin(AllowOrigin::exact(origin)),
            Err(_) => {
                tracing::warn!(origin, "Invalid CORS origin, allowing any");
                layer.allow_origin(Any)
            }
        },
        None => layer.allow_origin(Any),
    }
}

fn header_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
}

// ── WebSocket ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    let token = query.token.or_else(|| header_token(&headers));
    ws.on_upgrade(move |socket| handle_ws(socket, state, token))
}

async fn handle_ws(mut socket: WebSocket, state: Arc<SharedState>, token: Option<String>) {
    let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
    let (out_tx, out_rx) = mpsc::channel(state.config.outbound_buffer.max(1));
    let session = tokio::spawn(connection::run(state.clone(), token, in_rx, out_tx));

    pump_socket(
        &mut socket,
        in_tx,
        out_rx,
        state.config.ping_interval(),
        state.config.idle_timeout(),
    )
    .await;

    let close = match session.await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(CloseFrame {
            code: close_code::POLICY,
            reason: Utf8Bytes::from_static(e.kind()),
        }),
        Err(e) => {
            tracing::error!("Connection task failed: {e}");
            None
        }
    };
    let _ = socket.send(WsMessage::Close(close)).await;
}

/// Shuttle frames between the socket and the connection task until either
/// side finishes.
///
/// Inbound frames are decoded here and forwarded in order. Once the
/// connection task ends, everything it queued is still flushed before the
/// pump returns.
async fn pump_socket(
    socket: &mut WebSocket,
    inbound: mpsc::Sender<Inbound>,
    mut outbound: mpsc::Receiver<ServerEvent>,
    ping_interval: Duration,
    idle_timeout: Duration,
) {
    let mut reading = true;
    let mut last_seen = Instant::now();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            frame = socket.recv(), if reading => {
                let item = match frame {
                    Some(Ok(WsMessage::Text(text))) => decode_frame(text.as_bytes()),
                    Some(Ok(WsMessage::Binary(data))) => decode_frame(&data),
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {
                        // Ping/Pong: axum answers pings, we only track liveness
                        last_seen = Instant::now();
                        continue;
                    }
                };
                last_seen = Instant::now();
                if inbound.send(item).await.is_err() {
                    // Connection task is done; drain what it left behind
                    reading = false;
                }
            }
            event = outbound.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(event = event.name(), "Failed to encode event: {e}");
                        continue;
                    }
                };
                match tokio::time::timeout(WS_SEND_TIMEOUT, socket.send(WsMessage::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        tracing::debug!("WebSocket send failed or timed out, closing");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() >= idle_timeout {
                    tracing::info!("Idle timeout, closing");
                    break;
                }
                if socket.send(WsMessage::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = inbound.try_send(Inbound::Closed);
}

/// Decode one text or binary frame. Binary frames are read as UTF-8 JSON.
pub(crate) fn decode_frame(raw: &[u8]) -> Inbound {
    if raw.len() > MAX_FRAME_LEN {
        return Inbound::Malformed(format!("frame of {} bytes exceeds limit", raw.len()));
    }
    let Ok(text) = std::str::from_utf8(raw) else {
        return Inbound::Malformed("frame is not UTF-8".to_string());
    };
    match ClientEvent::parse(text) {
        Ok(event) => Inbound::Event(event),
        Err(e) => Inbound::Malformed(e.to_string()),
    }
}

// ── REST API ───────────────────────────────────────────────────────────

fn authenticate(state: &SharedState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let token = header_token(headers)
        .ok_or((StatusCode::UNAUTHORIZED, "missing bearer token".to_string()))?;
    state
        .verifier
        .verify(&token)
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.kind().to_string()))
}

fn store_unavailable(e: impl std::fmt::Display) -> ApiError {
    tracing::error!("Store error in API handler: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, "store unavailable".to_string())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    connections: usize,
    joined: usize,
    online_users: usize,
    uptime_secs: u64,
}

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        connections: state.connections.lock().len(),
        joined: state.presence.len(),
        online_users: state.presence.online_identities().len(),
        uptime_secs: state.uptime_secs(),
    })
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: String,
    pub display_name: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Every other known user, online flag from live presence.
async fn api_users(
    headers: HeaderMap,
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<UserResponse>>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    let online = state.presence.online_identities();
    let users = state
        .store
        .list_users()
        .map_err(store_unavailable)?
        .into_iter()
        .filter(|row| row.identity.id != caller.id)
        .map(|row| UserResponse {
            online: online.contains(&row.identity.id),
            id: row.identity.id,
            display_name: row.identity.display_name,
            last_seen: row.last_seen,
        })
        .collect();
    Ok(Json(users))
}

#[derive(Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
    /// Message id: return only messages stored before it.
    before: Option<String>,
}

/// Conversation between the caller and `user_id`, oldest-first.
async fn api_messages(
    Path(user_id): Path<String>,
    Query(query): Query<MessagesQuery>,
    headers: HeaderMap,
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let caller = authenticate(&state, &headers)?;
    if state
        .store
        .find_identity(&user_id)
        .map_err(store_unavailable)?
        .is_none()
    {
        return Err((StatusCode::NOT_FOUND, "unknown user".to_string()));
    }
    let limit = query
        .limit
        .unwrap_or(state.config.history_limit)
        .clamp(1, MAX_PAGE);
    let messages = state
        .store
        .conversation(&caller.id, &user_id, limit, query.before.as_deref())
        .map_err(store_unavailable)?;
    Ok(Json(messages))
}
