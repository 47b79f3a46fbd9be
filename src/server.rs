//! Network front end: WebSocket and HTTP long-poll transports over one port.
//!
//! ## Routes
//! - `GET /ws`, `GET /ws/<room>`: WebSocket upgrade; one text frame per event.
//! - `POST /poll[?room=<room>]`: open a polling connection → `{"connectionId"}`.
//! - `POST /poll/<id>`: body is one client event → `204`.
//! - `GET /poll/<id>`: wait up to `poll_wait_ms` → JSON array of server events.
//! - `DELETE /poll/<id>`: close the polling connection.
//! - `GET /health`: `{"status":"ok","rooms":N}`.
//!
//! Both transports feed the same [`ChatBroker`], so a WebSocket user and a
//! polling user in the same room see the same event order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use colored::*;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConnection, ChatBroker, ConnectionSender};
use crate::config::ChatConfig;
use crate::error::ServerError;
use crate::protocol::{ClientEvent, ServerEvent};

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A bound listener plus the broker it serves.
pub struct ChatServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

struct ServerState {
    broker: Arc<ChatBroker>,
    polls: PollRegistry,
    poll_wait: Duration,
}

impl ChatServer {
    /// Bind `config.host:config.port`. Port 0 picks a free port.
    pub async fn bind(config: ChatConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let poll_wait = config.poll_wait();
        let broker = Arc::new(ChatBroker::new(config));
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                broker,
                polls: PollRegistry::default(),
                poll_wait,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn broker(&self) -> Arc<ChatBroker> {
        Arc::clone(&self.state.broker)
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        let idle = self.state.broker.config().poll_idle_timeout();
        tokio::spawn(reap_idle_polls(Arc::clone(&self.state), idle));

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "accept failed; stopping server");
                    return Err(e.into());
                }
            };
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, state).await {
                    debug!(peer = %addr, error = %e, "connection error");
                }
            });
        }
    }
}

/// Bind and run with a startup banner.
pub async fn serve(config: ChatConfig) -> Result<(), ServerError> {
    let server = ChatServer::bind(config).await?;
    let addr = server.local_addr()?;

    eprintln!("{}", format!("  Chat server listening on ws://{addr}/ws").bright_green());
    eprintln!("{}", format!("  Long-poll fallback at http://{addr}/poll").bright_blue());
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
    info!(%addr, "server started");

    server.run().await
}

async fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) -> Result<(), ServerError> {
    // Peek at the first bytes to detect WebSocket upgrade requests.
    let mut peek_buf = [0u8; 1024];
    let peek_n = stream.peek(&mut peek_buf).await?;
    let peek_str = String::from_utf8_lossy(&peek_buf[..peek_n]);

    if peek_str.to_ascii_lowercase().contains("upgrade: websocket") {
        let path = peek_str
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/")
            .to_string();
        let Some(room) = ws_room(&path) else {
            write_response(&mut stream, 404, "text/plain", b"not found").await?;
            return Ok(());
        };
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let conn = state.broker.connect_to(&room);
        info!(room = %conn.room_name(), conn = %conn.id(), transport = "websocket", "client connected");
        handle_ws(ws, conn).await;
        return Ok(());
    }

    let Some(request) = read_request(&mut stream).await? else {
        return Ok(());
    };
    route(&mut stream, &state, request).await
}

/// Room named by a WebSocket path: `/ws` → default, `/ws/<room>` → `<room>`.
fn ws_room(path: &str) -> Option<String> {
    let (path, _) = path.split_once('?').unwrap_or((path, ""));
    match path {
        "/ws" | "/ws/" => Some(String::new()),
        p => p.strip_prefix("/ws/").map(url_decode),
    }
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

/// Pump frames between one WebSocket and its broker connection until either
/// side closes.
pub async fn handle_ws<S>(ws_stream: tokio_tungstenite::WebSocketStream<S>, conn: BrokerConnection)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (sender, mut events) = conn.into_split();

    loop {
        tokio::select! {
            // Frame from this client.
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => {
                            if !sender.send(event) {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(conn = %sender.id(), error = %e, "malformed event");
                            if let Ok(text) = serde_json::to_string(&malformed_event()) {
                                if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    },
                    Some(Ok(WsMessage::Close(_))) => break,
                    Some(Ok(_)) => {} // Ignore binary / ping / pong frames
                    Some(Err(_)) | None => break,
                }
            }

            // Event from the room.
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if let Ok(text) = serde_json::to_string(&event) {
                            if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    info!(conn = %sender.id(), transport = "websocket", "client disconnected");
    let _ = ws_sink.close().await;
}

fn malformed_event() -> ServerEvent {
    ServerEvent::Error {
        message: "Malformed event".to_string(),
        code: "malformed_event".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Long-poll transport
// ---------------------------------------------------------------------------

struct PollSession {
    sender: ConnectionSender,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEvent>>,
    last_seen: Mutex<Instant>,
}

impl PollSession {
    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap_or_else(|p| p.into_inner()).elapsed()
    }

    /// Wait up to `wait` for the first event, then take everything queued.
    async fn take_events(&self, wait: Duration) -> Vec<ServerEvent> {
        self.touch();
        let mut rx = self.events.lock().await;
        let mut out = Vec::new();
        if let Ok(Some(first)) = tokio::time::timeout(wait, rx.recv()).await {
            out.push(first);
            while let Ok(ev) = rx.try_recv() {
                out.push(ev);
            }
        }
        self.touch();
        out
    }
}

/// Open polling connections keyed by connection id.
#[derive(Default)]
struct PollRegistry {
    sessions: Mutex<HashMap<String, Arc<PollSession>>>,
}

impl PollRegistry {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<PollSession>>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn open(&self, conn: BrokerConnection) -> String {
        let (sender, events) = conn.into_split();
        let id = sender.id().to_string();
        let session = PollSession {
            sender,
            events: tokio::sync::Mutex::new(events),
            last_seen: Mutex::new(Instant::now()),
        };
        self.sessions().insert(id.clone(), Arc::new(session));
        id
    }

    fn get(&self, id: &str) -> Option<Arc<PollSession>> {
        self.sessions().get(id).cloned()
    }

    fn close(&self, id: &str) -> bool {
        self.sessions().remove(id).is_some()
    }

    /// Drop sessions idle longer than `max_idle`. Returns how many were dropped.
    fn reap(&self, max_idle: Duration) -> usize {
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, s| s.idle_for() <= max_idle);
        before - sessions.len()
    }
}

async fn reap_idle_polls(state: Arc<ServerState>, max_idle: Duration) {
    let period = (max_idle / 2).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let reaped = state.polls.reap(max_idle);
        if reaped > 0 {
            info!(reaped, transport = "polling", "idle polling connections closed");
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: String,
    body: Vec<u8>,
}

/// Read one request (head + `Content-Length` body). `None` on a closed socket.
async fn read_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>, ServerError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let (method, target, content_length, head_len) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ServerError::Http("connection closed mid-request".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_HEAD_BYTES + MAX_BODY_BYTES {
            return Err(ServerError::Http("request too large".into()));
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf)? {
            httparse::Status::Partial => {
                if buf.len() > MAX_HEAD_BYTES {
                    return Err(ServerError::Http("request head too large".into()));
                }
            }
            httparse::Status::Complete(head_len) => {
                let content_length = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                break (
                    req.method.unwrap_or("GET").to_string(),
                    req.path.unwrap_or("/").to_string(),
                    content_length,
                    head_len,
                );
            }
        }
    };

    if content_length > MAX_BODY_BYTES {
        return Err(ServerError::Http("request body too large".into()));
    }
    let mut body = buf.split_off(head_len);
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ServerError::Http("connection closed mid-body".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target, String::new()),
    };
    Ok(Some(HttpRequest { method, path, query, body }))
}

async fn route(stream: &mut TcpStream, state: &ServerState, req: HttpRequest) -> Result<(), ServerError> {
    let poll_id = req.path.strip_prefix("/poll/").filter(|id| !id.is_empty());

    match (req.method.as_str(), req.path.as_str(), poll_id) {
        ("GET", "/health", _) => {
            let body = serde_json::json!({
                "status": "ok",
                "rooms": state.broker.room_count(),
            });
            write_json(stream, 200, &body).await
        }
        ("OPTIONS", _, _) => write_response(stream, 204, "text/plain", b"").await,
        ("POST", "/poll", _) => {
            let params = parse_query(&req.query);
            let room = params.get("room").map(String::as_str).unwrap_or("");
            let conn = state.broker.connect_to(room);
            info!(room = %conn.room_name(), conn = %conn.id(), transport = "polling", "client connected");
            let id = state.polls.open(conn);
            write_json(stream, 200, &serde_json::json!({ "connectionId": id })).await
        }
        ("POST", _, Some(id)) => {
            let Some(session) = state.polls.get(id) else {
                return write_response(stream, 404, "text/plain", b"unknown connection").await;
            };
            session.touch();
            match serde_json::from_slice::<ClientEvent>(&req.body) {
                Ok(event) => {
                    session.sender.send(event);
                    write_response(stream, 204, "text/plain", b"").await
                }
                Err(e) => {
                    debug!(conn = %id, error = %e, "malformed event");
                    write_json(stream, 400, &malformed_event()).await
                }
            }
        }
        ("GET", _, Some(id)) => {
            let Some(session) = state.polls.get(id) else {
                return write_response(stream, 404, "text/plain", b"unknown connection").await;
            };
            let events = session.take_events(state.poll_wait).await;
            write_json(stream, 200, &events).await
        }
        ("DELETE", _, Some(id)) => {
            if state.polls.close(id) {
                info!(conn = %id, transport = "polling", "client disconnected");
                write_response(stream, 204, "text/plain", b"").await
            } else {
                write_response(stream, 404, "text/plain", b"unknown connection").await
            }
        }
        (method, path, _) => {
            warn!(%method, %path, "no route");
            write_response(stream, 404, "text/plain", b"not found").await
        }
    }
}

async fn write_json<T: serde::Serialize + ?Sized>(
    stream: &mut TcpStream,
    status: u16,
    body: &T,
) -> Result<(), ServerError> {
    let bytes = serde_json::to_vec(body).map_err(|e| ServerError::Http(e.to_string()))?;
    write_response(stream, status, "application/json", &bytes).await
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<(), ServerError> {
    let head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nAccess-Control-Allow-Methods: GET, POST, DELETE, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type\r\nConnection: close\r\n\r\n",
        reason(status),
        body.len(),
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    }
}

/// Percent-decoding for URL paths and query values.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a query string into key-value pairs. Later keys win.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, val) = pair.split_once('=').unwrap_or((pair, ""));
            (url_decode(key), url_decode(val))
        })
        .collect()
}
