//! In-process stand-in for the complaint backend: a Socket.IO room server on
//! `/socket.io/` and the two REST endpoints the chat uses.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use complaintchat::{AuthUser, ChatSession, Config, HttpComplaintApi};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::broadcast;

const EVERYONE: &str = "*";
const SERVER_CONN: u64 = u64::MAX;

#[derive(Clone, Debug)]
struct Outbound {
    room: String,
    from: u64,
    frame: String,
}

pub struct FakeBackend {
    /// token -> (user id, name)
    users: HashMap<String, (String, String)>,
    history: Mutex<HashMap<String, Vec<Value>>>,
    tx: broadcast::Sender<Outbound>,
    online: Mutex<HashMap<u64, String>>,
    joins: Mutex<Vec<(String, String)>>,
    frames: Mutex<Vec<String>>,
    posted: Mutex<Vec<String>>,
    next_conn: AtomicU64,
    next_id: AtomicU64,
    pub fail_sends: AtomicBool,
}

pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub addr: SocketAddr,
}

impl Harness {
    pub async fn start() -> Self {
        let users = [("asha", "tok-asha"), ("bea", "tok-bea")]
            .into_iter()
            .map(|(id, token)| (token.to_owned(), (id.to_owned(), capitalize(id))))
            .collect();
        let backend = Arc::new(FakeBackend {
            users,
            history: Mutex::default(),
            tx: broadcast::channel(64).0,
            online: Mutex::default(),
            joins: Mutex::default(),
            frames: Mutex::default(),
            posted: Mutex::default(),
            next_conn: AtomicU64::new(1),
            next_id: AtomicU64::new(99),
            fail_sends: AtomicBool::new(false),
        });

        let app = Router::new()
            .route("/socket.io/", get(socket))
            .route("/api/complaints/{id}", get(history))
            .route("/api/complaints/{id}/message", post(persist))
            .with_state(backend.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { backend, addr }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn config(&self, user: &str) -> Config {
        let mut config = Config::new(
            self.base_url(),
            format!("tok-{user}"),
            AuthUser {
                id: user.to_owned(),
                name: capitalize(user),
                role: "user".to_owned(),
            },
        );
        config.typing_window = Duration::from_millis(400);
        config
    }

    pub fn session(&self, user: &str) -> ChatSession<HttpComplaintApi> {
        self.session_with(self.config(user))
    }

    pub fn session_with(&self, config: Config) -> ChatSession<HttpComplaintApi> {
        let api = HttpComplaintApi::new(&config.api_url, config.token.clone());
        ChatSession::new(config, api)
    }
}

fn capitalize(id: &str) -> String {
    let mut chars = id.chars();
    chars
        .next()
        .map(|c| c.to_uppercase().chain(chars).collect())
        .unwrap_or_default()
}

impl FakeBackend {
    pub fn seed_history(&self, complaint: &str, messages: Vec<Value>) {
        self.history
            .lock()
            .unwrap()
            .insert(complaint.to_owned(), messages);
    }

    /// Emits an event to every socket joined to `room`.
    pub fn emit(&self, room: &str, event: &str, payload: Value) {
        self.publish(room, SERVER_CONN, event, payload);
    }

    pub fn joins(&self) -> Vec<(String, String)> {
        self.joins.lock().unwrap().clone()
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }

    pub fn posted(&self) -> Vec<String> {
        self.posted.lock().unwrap().clone()
    }

    pub async fn wait_for_join(&self, user: &str, room: &str) {
        eventually(|| async {
            self.joins()
                .iter()
                .any(|(u, r)| u == user && r == room)
        })
        .await;
    }

    fn publish(&self, room: &str, from: u64, event: &str, payload: Value) {
        let _ = self.tx.send(Outbound {
            room: room.to_owned(),
            from,
            frame: format!("42{}", json!([event, payload])),
        });
    }

    fn publish_presence(&self) {
        let mut ids: Vec<String> = self.online.lock().unwrap().values().cloned().collect();
        ids.sort();
        ids.dedup();
        self.publish(EVERYONE, SERVER_CONN, "onlineUsers", json!(ids));
    }

    fn user_for(&self, headers: &HeaderMap) -> Option<(String, String)> {
        let token = headers
            .get("authorization")?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?;
        self.users.get(token).cloned()
    }
}

/// Polls `check` every 10ms for up to five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Steps the session until `done` holds, for up to five seconds.
pub async fn step_until(
    session: &mut ChatSession<HttpComplaintApi>,
    mut done: impl FnMut(&ChatSession<HttpComplaintApi>) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(session) {
            session.step().await;
        }
    })
    .await
    .expect("session did not reach the expected state");
}

async fn history(
    State(backend): State<Arc<FakeBackend>>,
    Path(id): Path<String>,
) -> Response {
    if id == "404" {
        return (StatusCode::NOT_FOUND, Json(json!({ "message": "Complaint not found" })))
            .into_response();
    }
    let messages = backend
        .history
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .unwrap_or_default();
    Json(json!({ "_id": id, "messages": messages })).into_response()
}

async fn persist(
    State(backend): State<Arc<FakeBackend>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let Some((user_id, name)) = backend.user_for(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if backend.fail_sends.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let text = body["message"].as_str().unwrap_or_default().to_owned();
    backend.posted.lock().unwrap().push(text.clone());

    let message = json!({
        "_id": format!("m{}", backend.next_id.fetch_add(1, Ordering::SeqCst)),
        "sender": { "_id": user_id, "name": name },
        "message": text,
        "createdAt": time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap(),
    });
    backend
        .history
        .lock()
        .unwrap()
        .entry(id)
        .or_default()
        .push(message.clone());
    Json(message).into_response()
}

async fn socket(
    State(backend): State<Arc<FakeBackend>>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let user = query.get("userId").cloned().unwrap_or_default();
    ws.on_upgrade(async move |stream| serve_socket(backend, user, stream).await)
}

async fn serve_socket(backend: Arc<FakeBackend>, user: String, stream: WebSocket) {
    let conn = backend.next_conn.fetch_add(1, Ordering::SeqCst);
    let (mut sender, mut receiver) = stream.split();

    let open = r#"0{"sid":"s","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#;
    if sender.send(Message::Text(open.into())).await.is_err() {
        return;
    }

    let Some(Ok(Message::Text(auth))) = receiver.next().await else {
        return;
    };
    let token = auth
        .as_str()
        .strip_prefix("40")
        .and_then(|body| serde_json::from_str::<Value>(body).ok())
        .and_then(|v| v["token"].as_str().map(str::to_owned))
        .unwrap_or_default();
    if !backend.users.contains_key(&token) {
        let _ = sender
            .send(Message::Text(r#"44{"message":"Authentication error"}"#.into()))
            .await;
        return;
    }
    if sender.send(Message::Text(r#"40{"sid":"n"}"#.into())).await.is_err() {
        return;
    }

    let rooms: Arc<Mutex<HashSet<String>>> = Arc::default();
    let mut rx = backend.tx.subscribe();
    let joined = rooms.clone();
    let mut forward = tokio::spawn(async move {
        while let Ok(out) = rx.recv().await {
            if out.from == conn {
                continue;
            }
            let wanted = out.room == EVERYONE || joined.lock().unwrap().contains(&out.room);
            if wanted && sender.send(Message::Text(out.frame.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = &mut forward => break,
        };
        let Some(Ok(Message::Text(frame))) = frame else {
            break;
        };
        let frame = frame.to_string();
        backend.frames.lock().unwrap().push(frame.clone());

        if frame == "41" {
            break;
        }
        let Some(args) = frame
            .strip_prefix("42")
            .and_then(|body| serde_json::from_str::<Vec<Value>>(body).ok())
        else {
            continue;
        };
        let payload = args.get(1).cloned().unwrap_or(Value::Null);
        match args.first().and_then(Value::as_str) {
            Some("joinRoom") => {
                let room = payload.as_str().unwrap_or_default().to_owned();
                rooms.lock().unwrap().insert(room.clone());
                backend.online.lock().unwrap().insert(conn, user.clone());
                backend.joins.lock().unwrap().push((user.clone(), room));
                backend.publish_presence();
            }
            Some("newMessage") => {
                let room = payload["room"].as_str().unwrap_or_default().to_owned();
                backend.publish(&room, conn, "newMessage", payload["message"].clone());
            }
            Some("typing") => {
                let room = payload["room"].as_str().unwrap_or_default().to_owned();
                backend.publish(&room, conn, "typing", payload);
            }
            _ => {}
        }
    }

    forward.abort();
    backend.online.lock().unwrap().remove(&conn);
    backend.publish_presence();
}
