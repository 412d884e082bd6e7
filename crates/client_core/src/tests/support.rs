use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Multipart, Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use shared::{
    domain::{ConversationId, Credential, Identity, MessageId, ParticipantId, Role},
    protocol::{
        ChannelCommand, ChannelEvent, LoginRequest, LoginResponse, Message, OutboundMessage,
        RefreshRequest, RefreshResponse,
    },
};
use tokio::net::TcpListener;

use crate::config::{ClientSettings, ReconnectSettings};

pub(crate) const SERVER_PARTICIPANT: ParticipantId = ParticipantId(4);

/// In-process stand-in for the REST API and the live channel endpoint.
#[derive(Clone, Default)]
pub(crate) struct MockBackend {
    pub state: Arc<MockState>,
}

#[derive(Default)]
pub(crate) struct MockState {
    pub valid_token: Mutex<String>,
    pub refresh_calls: AtomicUsize,
    pub refresh_fail_status: AtomicU16,
    pub refresh_delay_ms: AtomicU64,
    pub refresh_tokens_seen: Mutex<Vec<String>>,
    pub protected_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub history: Mutex<Vec<Message>>,
    pub history_delay_ms: AtomicU64,
    pub history_calls: AtomicUsize,
    pub posted_messages: Mutex<Vec<OutboundMessage>>,
    pub post_fail_status: AtomicU16,
    pub read_marks: Mutex<Vec<String>>,
    pub mark_read_body: Mutex<Option<serde_json::Value>>,
    pub initial_frames: Mutex<Vec<ChannelEvent>>,
    pub ws_commands: Mutex<Vec<ChannelCommand>>,
    pub ws_connects: AtomicUsize,
    pub ws_reject: AtomicBool,
    pub close_connections_remaining: AtomicUsize,
    pub drop_after_next_send: AtomicBool,
    pub ws_tokens_seen: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn with_valid_token(token: &str) -> Self {
        let backend = Self::default();
        *backend.state.valid_token.lock().unwrap() = token.to_string();
        backend
    }

    pub fn set_history(&self, messages: Vec<Message>) {
        *self.state.history.lock().unwrap() = messages;
    }

    pub fn set_initial_frames(&self, frames: Vec<ChannelEvent>) {
        *self.state.initial_frames.lock().unwrap() = frames;
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {}", self.state.valid_token.lock().unwrap());
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == expected)
    }

    fn confirm(&self, conversation_id: i64, outbound: &OutboundMessage) -> Message {
        Message {
            id: outbound.id,
            conversation_id: ConversationId(conversation_id),
            sender: Some(SERVER_PARTICIPANT),
            body: outbound.body.clone(),
            attachments: outbound.attachments.clone(),
            created_at: Utc::now(),
            edited_at: None,
            receipts: Vec::new(),
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "access token expired" })),
    )
        .into_response()
}

async fn login(Json(request): Json<LoginRequest>) -> Response {
    if request.password != "correct-horse" {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "invalid credentials" })),
        )
            .into_response();
    }
    Json(LoginResponse {
        access_token: "access-login".into(),
        refresh_token: Some("refresh-login".into()),
        user: identity(),
    })
    .into_response()
}

async fn logout(State(backend): State<MockBackend>) -> StatusCode {
    backend.state.logout_calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

async fn refresh(
    State(backend): State<MockBackend>,
    Json(request): Json<RefreshRequest>,
) -> Response {
    let call = backend.state.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    backend
        .state
        .refresh_tokens_seen
        .lock()
        .unwrap()
        .push(request.refresh_token);

    let delay = backend.state.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let fail_status = backend.state.refresh_fail_status.load(Ordering::SeqCst);
    if fail_status != 0 {
        let status = StatusCode::from_u16(fail_status).unwrap_or(StatusCode::BAD_REQUEST);
        return (status, Json(json!({ "error": "refresh token expired" }))).into_response();
    }

    let access_token = format!("access-renewed-{call}");
    *backend.state.valid_token.lock().unwrap() = access_token.clone();
    Json(RefreshResponse {
        access_token,
        refresh_token: Some(format!("refresh-rotated-{call}")),
    })
    .into_response()
}

async fn protected(State(backend): State<MockBackend>, headers: HeaderMap) -> Response {
    backend.state.protected_calls.fetch_add(1, Ordering::SeqCst);
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "project": "north-tower", "status": "framing" })).into_response()
}

async fn empty(State(backend): State<MockBackend>, headers: HeaderMap) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn structured_error() -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "code": "validation", "message": "quote is locked" })),
    )
        .into_response()
}

async fn plain_error() -> Response {
    (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response()
}

async fn upload(
    State(backend): State<MockBackend>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    backend.state.protected_calls.fetch_add(1, Ordering::SeqCst);
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let mut fields = Vec::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map(|b| b.len()).unwrap_or_default();
        fields.push(json!({ "name": name, "filename": filename, "len": bytes }));
    }
    Json(json!({ "content_type": content_type, "fields": fields })).into_response()
}

async fn list_messages(
    State(backend): State<MockBackend>,
    headers: HeaderMap,
    Path(conversation_id): Path<i64>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    backend.state.history_calls.fetch_add(1, Ordering::SeqCst);
    let delay = backend.state.history_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if !backend.authorized(&headers) {
        return unauthorized();
    }

    let history: Vec<Message> = backend
        .state
        .history
        .lock()
        .unwrap()
        .iter()
        .filter(|message| message.conversation_id.0 == conversation_id)
        .cloned()
        .collect();
    let end = match query.get("before") {
        Some(before) => history
            .iter()
            .position(|message| message.id.to_string() == *before)
            .unwrap_or(history.len()),
        None => history.len(),
    };
    let limit: usize = query
        .get("limit")
        .and_then(|limit| limit.parse().ok())
        .unwrap_or(50);
    let start = end.saturating_sub(limit);
    Json(history[start..end].to_vec()).into_response()
}

async fn post_message(
    State(backend): State<MockBackend>,
    headers: HeaderMap,
    Path(conversation_id): Path<i64>,
    Json(outbound): Json<OutboundMessage>,
) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    let fail_status = backend.state.post_fail_status.load(Ordering::SeqCst);
    if fail_status != 0 {
        let status =
            StatusCode::from_u16(fail_status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        return (
            status,
            Json(json!({ "message": "message store unavailable" })),
        )
            .into_response();
    }
    backend
        .state
        .posted_messages
        .lock()
        .unwrap()
        .push(outbound.clone());
    (
        StatusCode::CREATED,
        Json(backend.confirm(conversation_id, &outbound)),
    )
        .into_response()
}

async fn mark_read(
    State(backend): State<MockBackend>,
    headers: HeaderMap,
    Path((_conversation_id, message_id)): Path<(i64, String)>,
) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    backend.state.read_marks.lock().unwrap().push(message_id);
    match backend.state.mark_read_body.lock().unwrap().clone() {
        Some(body) => Json(body).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn live_channel(
    ws: WebSocketUpgrade,
    State(backend): State<MockBackend>,
    Path(conversation_id): Path<i64>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let token = query.get("token").cloned().unwrap_or_default();
    backend.state.ws_tokens_seen.lock().unwrap().push(token.clone());
    let valid = *backend.state.valid_token.lock().unwrap() == token;
    if !valid || backend.state.ws_reject.load(Ordering::SeqCst) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| serve_socket(socket, backend, conversation_id))
}

async fn serve_socket(mut socket: WebSocket, backend: MockBackend, conversation_id: i64) {
    backend.state.ws_connects.fetch_add(1, Ordering::SeqCst);
    let frames = backend.state.initial_frames.lock().unwrap().clone();
    for frame in frames {
        let text = serde_json::to_string(&frame).unwrap();
        if socket.send(WsMessage::Text(text)).await.is_err() {
            return;
        }
    }

    let close_now = backend
        .state
        .close_connections_remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
            remaining.checked_sub(1)
        })
        .is_ok();
    if close_now {
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }

    while let Some(Ok(frame)) = socket.recv().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let Ok(command) = serde_json::from_str::<ChannelCommand>(&text) else {
            continue;
        };
        backend.state.ws_commands.lock().unwrap().push(command.clone());
        if let ChannelCommand::SendMessage(outbound) = command {
            if backend.state.drop_after_next_send.swap(false, Ordering::SeqCst) {
                return;
            }
            let echo = ChannelEvent::Message(backend.confirm(conversation_id, &outbound));
            let text = serde_json::to_string(&echo).unwrap();
            if socket.send(WsMessage::Text(text)).await.is_err() {
                return;
            }
        }
    }
}

pub(crate) async fn spawn_backend(backend: MockBackend) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/projects/current", get(protected))
        .route("/api/empty", get(empty))
        .route("/api/structured-error", get(structured_error))
        .route("/api/plain-error", get(plain_error))
        .route("/api/documents", post(upload))
        .route(
            "/api/conversations/:conversation_id/messages",
            get(list_messages).post(post_message),
        )
        .route(
            "/api/conversations/:conversation_id/messages/:message_id/read",
            post(mark_read),
        )
        .route("/api/conversations/:conversation_id/ws", get(live_channel))
        .with_state(backend);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

pub(crate) fn test_settings(base_url: &str) -> ClientSettings {
    ClientSettings {
        base_url: base_url.to_string(),
        base_path: "/api".into(),
        session_database_url: "sqlite::memory:".into(),
        request_timeout_secs: 5,
        history_page_size: 50,
        history_max_pages: 5,
        pending_read_ttl_secs: 30,
        reconnect: ReconnectSettings {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 20,
            max_delay_ms: 50,
        },
    }
}

pub(crate) fn identity() -> Identity {
    Identity {
        participant_id: ParticipantId(7),
        username: "buyer@example.com".into(),
        display_name: Some("Dana Buyer".into()),
        role: Role::Customer,
    }
}

pub(crate) fn credential(access_token: &str, refresh_token: Option<&str>) -> Credential {
    Credential {
        access_token: access_token.to_string(),
        refresh_token: refresh_token.map(str::to_string),
        identity: identity(),
    }
}

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

pub(crate) fn message(conversation_id: i64, seconds: i64, body: &str) -> Message {
    Message {
        id: MessageId::new(),
        conversation_id: ConversationId(conversation_id),
        sender: Some(SERVER_PARTICIPANT),
        body: body.to_string(),
        attachments: Vec::new(),
        created_at: at(seconds),
        edited_at: None,
        receipts: Vec::new(),
    }
}

/// Polls `check` until it holds or a few seconds pass.
pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
