//! In-process fake of the Kindred backend (REST + chat WebSocket).
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use kindred::api::ApiClient;
use kindred::auth::{CredentialPair, CredentialStore, MemoryCredentialStore};

/// Id of the signed-in user as the backend reports it.
pub const ME_ID: &str = "u-me";

pub const PASSWORD: &str = "correct horse";

pub struct Backend {
    /// Access token the backend currently accepts.
    pub valid_access: Mutex<String>,
    pub valid_refresh: Mutex<String>,
    issued: AtomicUsize,

    pub refresh_calls: AtomicUsize,
    pub refresh_fails: AtomicBool,
    pub refresh_delay_ms: AtomicU64,

    /// `Authorization` headers seen on `/users/profiles/me/`.
    pub me_auth_headers: Mutex<Vec<Option<String>>>,
    /// `Authorization` headers seen on the credential-issuing endpoints.
    pub auth_endpoint_headers: Mutex<Vec<Option<String>>>,
    /// Reject every call to `/users/profiles/me/` with 401.
    pub me_always_unauthorized: AtomicBool,

    pub uploads: Mutex<Vec<Vec<String>>>,
    pub deleted_photos: Mutex<Vec<String>>,
    pub swipes: Mutex<Vec<Value>>,

    /// Newest-first history per match id.
    pub history: Mutex<HashMap<String, Vec<Value>>>,
    pub history_calls: AtomicUsize,
    /// Number of upcoming history calls answered with 503.
    pub history_failures: AtomicUsize,

    pub ws_reject: AtomicBool,
    pub ws_connections: AtomicUsize,
    pub ws_open: AtomicUsize,
    /// Match ids of the sockets currently being served, in open order.
    pub open_rooms: Mutex<Vec<String>>,
    pub ws_tokens: Mutex<Vec<String>>,
    pub ws_received: Mutex<Vec<String>>,
    push: broadcast::Sender<(String, String)>,
}

impl Backend {
    fn new() -> Self {
        let (push, _) = broadcast::channel(64);
        Self {
            valid_access: Mutex::new("access-0".to_string()),
            valid_refresh: Mutex::new("refresh-0".to_string()),
            issued: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            refresh_fails: AtomicBool::new(false),
            refresh_delay_ms: AtomicU64::new(0),
            me_auth_headers: Mutex::new(Vec::new()),
            auth_endpoint_headers: Mutex::new(Vec::new()),
            me_always_unauthorized: AtomicBool::new(false),
            uploads: Mutex::new(Vec::new()),
            deleted_photos: Mutex::new(Vec::new()),
            swipes: Mutex::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            history_calls: AtomicUsize::new(0),
            history_failures: AtomicUsize::new(0),
            ws_reject: AtomicBool::new(false),
            ws_connections: AtomicUsize::new(0),
            ws_open: AtomicUsize::new(0),
            open_rooms: Mutex::new(Vec::new()),
            ws_tokens: Mutex::new(Vec::new()),
            ws_received: Mutex::new(Vec::new()),
            push,
        }
    }

    pub fn access(&self) -> String {
        self.valid_access.lock().unwrap().clone()
    }

    pub fn set_history(&self, match_id: &str, newest_first: Vec<Value>) {
        self.history
            .lock()
            .unwrap()
            .insert(match_id.to_string(), newest_first);
    }

    /// Send a frame to every open socket of `match_id`.
    pub fn push_frame(&self, match_id: &str, frame: Value) {
        let _ = self.push.send((match_id.to_string(), frame.to_string()));
    }

    pub fn open_rooms(&self) -> Vec<String> {
        self.open_rooms.lock().unwrap().clone()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        bearer(headers).as_deref() == Some(format!("Bearer {}", self.access()).as_str())
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub backend: Arc<Backend>,
    _task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let backend = Arc::new(Backend::new());
        let app = Router::new()
            .route("/api/users/auth/login/", post(login))
            .route("/api/users/auth/register/", post(register))
            .route("/api/users/auth/refresh/", post(refresh))
            .route("/api/users/profiles/", get(feed))
            .route("/api/users/profiles/me/", get(me).patch(update_me))
            .route("/api/users/photos/", post(upload_photo))
            .route("/api/users/photos/{id}/", delete(delete_photo))
            .route("/api/social/matches/", get(matches))
            .route("/api/social/swipes/", post(swipe))
            .route("/api/chat/messages/", get(history))
            .route("/ws/chat/{match_id}/", get(chat_ws))
            .with_state(backend.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            addr,
            backend,
            _task: task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/chat", self.addr)
    }

    pub fn client(&self, store: Arc<dyn CredentialStore>) -> Arc<ApiClient> {
        Arc::new(ApiClient::new(self.base_url(), Duration::from_secs(5), store).unwrap())
    }
}

pub fn signed_in(access: &str) -> Arc<MemoryCredentialStore> {
    Arc::new(MemoryCredentialStore::with_pair(CredentialPair::new(
        access,
        "refresh-0",
    )))
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"detail": "Given token not valid for any token type", "code": "token_not_valid"})),
    )
        .into_response()
}

fn tokens(backend: &Backend) -> Value {
    json!({
        "access": backend.access(),
        "refresh": backend.valid_refresh.lock().unwrap().clone(),
    })
}

fn current_profile(bio: Option<&str>) -> Value {
    json!({
        "id": ME_ID,
        "first_name": "Ana",
        "email": "ana@example.com",
        "bio": bio,
        "work": "Cartographer",
        "age": 31,
        "gender": "F",
        "gender_preference": "A",
        "max_distance": 50,
        "min_age": 25,
        "max_age": 40,
        "photos": [{"id": 3, "image": "http://cdn/3.jpg", "is_main": true, "caption": null}],
        "location": {"lat": 40.4, "lng": -3.7}
    })
}

async fn login(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    backend
        .auth_endpoint_headers
        .lock()
        .unwrap()
        .push(bearer(&headers));
    if body["password"] == PASSWORD {
        Json(tokens(&backend)).into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "No active account found with the given credentials"})),
        )
            .into_response()
    }
}

async fn register(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    backend
        .auth_endpoint_headers
        .lock()
        .unwrap()
        .push(bearer(&headers));
    if body["password"] != body["password_confirm"] {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"password": ["Password fields didn't match."]})),
        )
            .into_response();
    }
    (StatusCode::CREATED, Json(tokens(&backend))).into_response()
}

async fn refresh(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    backend
        .auth_endpoint_headers
        .lock()
        .unwrap()
        .push(bearer(&headers));
    backend.refresh_calls.fetch_add(1, Ordering::SeqCst);

    let delay = backend.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let expected = backend.valid_refresh.lock().unwrap().clone();
    if backend.refresh_fails.load(Ordering::SeqCst) || body["refresh"] != expected.as_str() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Token is invalid or expired", "code": "token_not_valid"})),
        )
            .into_response();
    }

    let n = backend.issued.fetch_add(1, Ordering::SeqCst) + 1;
    let access = format!("access-{n}");
    *backend.valid_access.lock().unwrap() = access.clone();
    // No refresh rotation: only a new access token comes back.
    Json(json!({ "access": access })).into_response()
}

async fn me(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    backend
        .me_auth_headers
        .lock()
        .unwrap()
        .push(bearer(&headers));
    if backend.me_always_unauthorized.load(Ordering::SeqCst) || !backend.authorized(&headers) {
        return unauthorized();
    }
    Json(current_profile(Some("Maps and mountains"))).into_response()
}

async fn update_me(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    if body.get("min_age").and_then(Value::as_u64).is_some_and(|age| age < 18) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"min_age": ["Ensure this value is greater than or equal to 18."]})),
        )
            .into_response();
    }
    Json(current_profile(body["bio"].as_str())).into_response()
}

async fn feed(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    Json(json!([
        {"id": "p-1", "first_name": "Lucia", "age": 29, "gender": "F", "photos": [], "distance_km": 4},
        {"id": "p-2", "first_name": "Sam", "age": 33, "gender": "NB", "photos": [], "distance_km": null}
    ]))
    .into_response()
}

async fn upload_photo(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    let mut fields = Vec::new();
    let mut caption = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let data = field.bytes().await.unwrap_or_default();
        if name == "caption" {
            caption = Some(String::from_utf8_lossy(&data).into_owned());
        }
        fields.push(name);
    }
    backend.uploads.lock().unwrap().push(fields);
    (
        StatusCode::CREATED,
        Json(json!({"id": 9, "image": "http://cdn/9.jpg", "is_main": false, "caption": caption})),
    )
        .into_response()
}

async fn delete_photo(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    backend.deleted_photos.lock().unwrap().push(id);
    StatusCode::NO_CONTENT.into_response()
}

async fn matches(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    Json(json!([{
        "id": "m-1",
        "created_at": "2025-03-01T08:30:00Z",
        "other_user": {"id": "p-1", "first_name": "Lucia", "age": 29, "photos": []}
    }]))
    .into_response()
}

async fn swipe(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    backend.swipes.lock().unwrap().push(body.clone());
    let is_match = body["target"] == "p-1" && body["value"] == "LIKE";
    let details = is_match.then(|| {
        json!({"id": "m-1", "created_at": "2025-03-01T08:30:00Z", "other_user": null})
    });
    (
        StatusCode::CREATED,
        Json(json!({"match": is_match, "swipe_id": 7, "match_details": details})),
    )
        .into_response()
}

async fn history(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !backend.authorized(&headers) {
        return unauthorized();
    }
    backend.history_calls.fetch_add(1, Ordering::SeqCst);
    let remaining = backend.history_failures.load(Ordering::SeqCst);
    if remaining > 0 {
        backend.history_failures.store(remaining - 1, Ordering::SeqCst);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let Some(match_id) = query.get("match_id") else {
        return (StatusCode::BAD_REQUEST, Json(json!({"detail": "match_id required"})))
            .into_response();
    };
    let page = backend
        .history
        .lock()
        .unwrap()
        .get(match_id)
        .cloned()
        .unwrap_or_default();
    Json(Value::Array(page)).into_response()
}

async fn chat_ws(
    ws: WebSocketUpgrade,
    State(backend): State<Arc<Backend>>,
    Path(match_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let token = query.get("token").cloned().unwrap_or_default();
    if backend.ws_reject.load(Ordering::SeqCst) || token != backend.access() {
        return StatusCode::FORBIDDEN.into_response();
    }
    backend.ws_connections.fetch_add(1, Ordering::SeqCst);
    backend.ws_tokens.lock().unwrap().push(token);
    ws.on_upgrade(move |socket| chat_session(backend, match_id, socket))
}

async fn chat_session(backend: Arc<Backend>, match_id: String, socket: WebSocket) {
    let mut pushes = backend.push.subscribe();
    let (mut sender, mut receiver) = socket.split();
    backend.ws_open.fetch_add(1, Ordering::SeqCst);
    backend.open_rooms.lock().unwrap().push(match_id.clone());

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    backend.ws_received.lock().unwrap().push(text.to_string());
                    let body: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
                    let echo = json!({
                        "message": body["message"],
                        "sender_id": ME_ID,
                        "timestamp": chrono::Utc::now(),
                    });
                    if sender.send(Message::Text(echo.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            pushed = pushes.recv() => match pushed {
                Ok((room, frame)) if room == match_id => {
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }

    backend
        .open_rooms
        .lock()
        .unwrap()
        .retain(|room| room != &match_id);
    backend.ws_open.fetch_sub(1, Ordering::SeqCst);
}
