/// In-process mock backend for integration tests: a hyper HTTP server for
/// the REST surface and a tungstenite acceptor for the push channel, with
/// scripted failure modes and call counters.
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use leadwire_core::Config;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub const TOKEN: &str = "test-token";

pub struct MockState {
    pub current_user: AtomicI64,
    pub messages: Mutex<Vec<serde_json::Value>>,
    pub notifications: Mutex<Vec<serde_json::Value>>,
    pub next_message_id: AtomicI64,

    // Call counters
    pub thread_read_calls: AtomicUsize,
    pub notification_read_calls: AtomicUsize,
    pub message_fetches: AtomicUsize,
    pub notification_fetches: AtomicUsize,
    pub ws_connections: AtomicUsize,

    // Scripted behavior
    pub apply_read: AtomicBool,
    pub echo_tags: AtomicBool,
    pub fail_send: AtomicBool,
    pub fail_notification_read: AtomicBool,
    pub unauthorized: AtomicBool,

    ws_clients: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    kick: broadcast::Sender<()>,
}

pub struct MockBackend {
    pub http_addr: SocketAddr,
    pub ws_addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockBackend {
    pub async fn start(current_user: i64) -> Self {
        let (kick, _) = broadcast::channel(8);
        let state = Arc::new(MockState {
            current_user: AtomicI64::new(current_user),
            messages: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            next_message_id: AtomicI64::new(100),
            thread_read_calls: AtomicUsize::new(0),
            notification_read_calls: AtomicUsize::new(0),
            message_fetches: AtomicUsize::new(0),
            notification_fetches: AtomicUsize::new(0),
            ws_connections: AtomicUsize::new(0),
            apply_read: AtomicBool::new(true),
            echo_tags: AtomicBool::new(true),
            fail_send: AtomicBool::new(false),
            fail_notification_read: AtomicBool::new(false),
            unauthorized: AtomicBool::new(false),
            ws_clients: Mutex::new(Vec::new()),
            kick,
        });

        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = http_listener.local_addr().unwrap();
        let http_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = http_listener.accept().await else {
                    break;
                };
                let state = http_state.clone();
                tokio::spawn(async move {
                    let service =
                        service_fn(move |req| handle_http(req, state.clone()));
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();
        let ws_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = ws_listener.accept().await else {
                    break;
                };
                let state = ws_state.clone();
                tokio::spawn(async move {
                    serve_ws_client(stream, state).await;
                });
            }
        });

        Self {
            http_addr,
            ws_addr,
            state,
        }
    }

    /// Config pointing the engine at this backend, with test-speed timers
    pub fn config(&self, poll_ms: u64) -> Config {
        Config {
            api_base: format!("http://{}", self.http_addr),
            push_url: format!("ws://{}", self.ws_addr),
            token: TOKEN.to_string(),
            current_user: self.state.current_user.load(Ordering::SeqCst),
            poll_interval: Duration::from_millis(poll_ms),
            notification_poll_interval: Duration::from_millis(200),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            reconnect_base: Duration::from_millis(50),
            reconnect_ceiling: Duration::from_millis(200),
            max_reconnect_attempts: None,
            match_window: Duration::from_secs(10),
        }
    }

    /// Seed a message as the server would store it
    pub fn add_message(&self, id: i64, thread_id: i64, sender_id: i64, receiver_id: i64, body: &str, read: bool) {
        let created_at = (Utc::now() - ChronoDuration::seconds(60)).to_rfc3339();
        self.state.messages.lock().unwrap().push(serde_json::json!({
            "id": id,
            "thread_id": thread_id,
            "sender_id": sender_id,
            "receiver_id": receiver_id,
            "body": body,
            "created_at": created_at,
            "read": read,
        }));
    }

    pub fn add_notification(&self, value: serde_json::Value) {
        self.state.notifications.lock().unwrap().push(value);
    }

    /// Deliver a frame to every connected push client
    pub fn push(&self, value: &serde_json::Value) {
        let text = value.to_string();
        let clients = self.state.ws_clients.lock().unwrap();
        for tx in clients.iter() {
            let _ = tx.send(text.clone());
        }
    }

    /// Force-close every open push connection
    pub fn kick_push_clients(&self) {
        let _ = self.state.kick.send(());
    }

    pub fn notification(id: i64, kind: &str, severity: &str, read: bool) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "title": format!("notification {}", id),
            "message": "something happened",
            "type": kind,
            "severity": severity,
            "read": read,
            "created_at": Utc::now().to_rfc3339(),
        })
    }
}

async fn serve_ws_client(stream: tokio::net::TcpStream, state: Arc<MockState>) {
    // Verify the credential travels as a query parameter
    let authorized = Arc::new(AtomicBool::new(false));
    let check = authorized.clone();
    let callback = move |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                         resp: tokio_tungstenite::tungstenite::handshake::server::Response| {
        let ok = req
            .uri()
            .query()
            .map(|q| q.contains(&format!("token={}", TOKEN)))
            .unwrap_or(false);
        check.store(ok, Ordering::SeqCst);
        Ok(resp)
    };

    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    if !authorized.load(Ordering::SeqCst) {
        return;
    }

    state.ws_connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.ws_clients.lock().unwrap().push(tx);
    let mut kick = state.kick.subscribe();

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(text) => {
                    if sink.send(WsMessage::text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            msg = source.next() => match msg {
                Some(Ok(_)) => {}
                _ => break,
            },
            _ = kick.recv() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
}

fn json_resp(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

async fn handle_http(
    req: Request<Incoming>,
    state: Arc<MockState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if state.unauthorized.load(Ordering::SeqCst) {
        return Ok(json_resp(
            StatusCode::UNAUTHORIZED,
            serde_json::json!({"error": "token expired"}),
        ));
    }

    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    if bearer.as_deref() != Some(&format!("Bearer {}", TOKEN)) {
        return Ok(json_resp(
            StatusCode::UNAUTHORIZED,
            serde_json::json!({"error": "missing credential"}),
        ));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let body_bytes = req.into_body().collect().await.unwrap().to_bytes();

    let resp = match (method, segments.as_slice()) {
        (Method::GET, ["threads"]) => {
            json_resp(StatusCode::OK, serde_json::json!([]))
        }
        (Method::GET, ["threads", _lead, "messages"]) => {
            state.message_fetches.fetch_add(1, Ordering::SeqCst);
            let messages = state.messages.lock().unwrap().clone();
            json_resp(StatusCode::OK, serde_json::Value::Array(messages))
        }
        (Method::POST, ["threads", _lead, "messages", "read"]) => {
            state.thread_read_calls.fetch_add(1, Ordering::SeqCst);
            if state.apply_read.load(Ordering::SeqCst) {
                for msg in state.messages.lock().unwrap().iter_mut() {
                    msg["read"] = serde_json::Value::Bool(true);
                }
            }
            json_resp(StatusCode::OK, serde_json::json!({"ok": true}))
        }
        (Method::POST, ["threads", lead, "messages"]) => {
            if state.fail_send.load(Ordering::SeqCst) {
                json_resp(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({"error": "send rejected"}),
                )
            } else {
                let body: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();
                let id = state.next_message_id.fetch_add(1, Ordering::SeqCst);
                let mut message = serde_json::json!({
                    "id": id,
                    "thread_id": lead.parse::<i64>().unwrap(),
                    "sender_id": state.current_user.load(Ordering::SeqCst),
                    "receiver_id": body["receiver_id"],
                    "body": body["content"],
                    "created_at": Utc::now().to_rfc3339(),
                    "read": false,
                });
                if state.echo_tags.load(Ordering::SeqCst) {
                    message["client_tag"] = body["client_tag"].clone();
                }
                state.messages.lock().unwrap().push(message.clone());
                json_resp(StatusCode::OK, message)
            }
        }
        (Method::GET, ["notifications"]) => {
            state.notification_fetches.fetch_add(1, Ordering::SeqCst);
            let notifications = state.notifications.lock().unwrap().clone();
            json_resp(StatusCode::OK, serde_json::Value::Array(notifications))
        }
        (Method::PATCH, ["notifications", id, "read"]) => {
            state.notification_read_calls.fetch_add(1, Ordering::SeqCst);
            if state.fail_notification_read.load(Ordering::SeqCst) {
                json_resp(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({"error": "mark failed"}),
                )
            } else {
                let id = id.parse::<i64>().unwrap();
                for n in state.notifications.lock().unwrap().iter_mut() {
                    if n["id"].as_i64() == Some(id) {
                        n["read"] = serde_json::Value::Bool(true);
                    }
                }
                json_resp(StatusCode::OK, serde_json::json!({"ok": true}))
            }
        }
        _ => json_resp(
            StatusCode::NOT_FOUND,
            serde_json::json!({"error": format!("no route for {}", path)}),
        ),
    };

    Ok(resp)
}
