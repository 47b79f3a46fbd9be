//! Client transports.
//!
//! A [`Connector`] performs one connection attempt and, on success, yields a
//! [`Link`]: an outbound sender and an inbound receiver of typed events.
//! Dropping the outbound sender closes the underlying transport; the inbound
//! receiver ending means the transport was lost.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::broker::ChatBroker;
use crate::error::ClientError;
use crate::protocol::{ClientEvent, ServerEvent};

/// An established connection, as seen by the client driver.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
}

pub trait Connector: Send + Sync {
    /// Make one connection attempt.
    fn connect(&self) -> BoxFuture<'static, Result<Link, ClientError>>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// WebSocket and polling URLs derived from one user-supplied server URL.
///
/// Accepts `ws://`, `wss://`, `http://` or `https://`, with an optional
/// `/ws/<room>` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub ws_url: String,
    pub http_base: String,
    pub room: Option<String>,
}

impl Endpoints {
    pub fn parse(url: &str) -> Result<Self, ClientError> {
        let url = url.trim();
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| ClientError::InvalidUrl(url.to_string()))?;
        let (ws_scheme, http_scheme) = match scheme.to_ascii_lowercase().as_str() {
            "ws" | "http" => ("ws", "http"),
            "wss" | "https" => ("wss", "https"),
            _ => return Err(ClientError::InvalidUrl(url.to_string())),
        };
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        if authority.is_empty() {
            return Err(ClientError::InvalidUrl(url.to_string()));
        }
        let path = path.trim_end_matches('/');
        let room = path
            .strip_prefix("ws/")
            .or_else(|| path.strip_prefix("poll/"))
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        let ws_url = match &room {
            Some(r) => format!("{ws_scheme}://{authority}/ws/{r}"),
            None => format!("{ws_scheme}://{authority}/ws"),
        };
        Ok(Self {
            ws_url,
            http_base: format!("{http_scheme}://{authority}"),
            room,
        })
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Link, ClientError>> {
        let url = self.url.clone();
        Box::pin(async move {
            let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump_ws(ws, out_rx, in_tx));
            debug!(%url, "websocket connected");
            Ok(Link { outbound: out_tx, inbound: in_rx })
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

async fn pump_ws<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<ClientEvent>,
    inbound: mpsc::UnboundedSender<ServerEvent>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if inbound.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "undecodable server event"),
                    },
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    let _ = sink.close().await;
}

// ---------------------------------------------------------------------------
// HTTP long-poll
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollOpened {
    connection_id: String,
}

#[derive(Debug, Clone)]
pub struct PollingConnector {
    base_url: String,
    room: Option<String>,
    http: reqwest::Client,
}

impl PollingConnector {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:3001`.
    pub fn new(base_url: impl Into<String>, room: Option<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            room,
            http,
        })
    }
}

impl Connector for PollingConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Link, ClientError>> {
        let this = self.clone();
        Box::pin(async move {
            let mut request = this.http.post(format!("{}/poll", this.base_url));
            if let Some(room) = &this.room {
                request = request.query(&[("room", room)]);
            }
            let resp = request
                .send()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(ClientError::Transport(format!("HTTP {} opening poll", resp.status())));
            }
            let opened: PollOpened = resp
                .json()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;

            let url = format!("{}/poll/{}", this.base_url, opened.connection_id);
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            tokio::spawn(poll_sender(this.http.clone(), url.clone(), out_rx));
            tokio::spawn(poll_receiver(this.http, url, in_tx));
            debug!(conn = %opened.connection_id, "polling connected");
            Ok(Link { outbound: out_tx, inbound: in_rx })
        })
    }

    fn describe(&self) -> String {
        format!("{}/poll", self.base_url)
    }
}

/// Forward outbound events as `POST`s; `DELETE` once the link is dropped.
async fn poll_sender(http: reqwest::Client, url: String, mut outbound: mpsc::UnboundedReceiver<ClientEvent>) {
    while let Some(event) = outbound.recv().await {
        match http.post(&url).json(&event).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "poll send rejected");
                break;
            }
            Err(e) => {
                warn!(error = %e, "poll send failed");
                break;
            }
        }
    }
    let _ = http.delete(&url).send().await;
}

/// Long-poll until the server forgets us or the client drops the link.
async fn poll_receiver(http: reqwest::Client, url: String, inbound: mpsc::UnboundedSender<ServerEvent>) {
    while !inbound.is_closed() {
        let resp = match http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "poll receive rejected");
                break;
            }
            Err(e) => {
                warn!(error = %e, "poll receive failed");
                break;
            }
        };
        let events: Vec<ServerEvent> = match resp.json().await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "undecodable poll batch");
                break;
            }
        };
        for event in events {
            if inbound.send(event).is_err() {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Auto (WebSocket, then polling)
// ---------------------------------------------------------------------------

pub struct AutoConnector {
    ws: WsConnector,
    polling: PollingConnector,
}

impl AutoConnector {
    pub fn new(ws: WsConnector, polling: PollingConnector) -> Self {
        Self { ws, polling }
    }

    pub fn from_url(url: &str) -> Result<Self, ClientError> {
        let endpoints = Endpoints::parse(url)?;
        Ok(Self {
            ws: WsConnector::new(endpoints.ws_url),
            polling: PollingConnector::new(endpoints.http_base, endpoints.room)?,
        })
    }
}

impl Connector for AutoConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Link, ClientError>> {
        let ws = self.ws.connect();
        let polling = self.polling.clone();
        Box::pin(async move {
            match ws.await {
                Ok(link) => Ok(link),
                Err(e) => {
                    warn!(error = %e, "websocket unavailable; falling back to long-poll");
                    polling.connect().await
                }
            }
        })
    }

    fn describe(&self) -> String {
        format!("{} (fallback {})", self.ws.describe(), self.polling.describe())
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// Link straight into a [`ChatBroker`] running in the same process.
#[derive(Clone)]
pub struct LocalConnector {
    broker: Arc<ChatBroker>,
    room: String,
}

impl LocalConnector {
    pub fn new(broker: Arc<ChatBroker>, room: impl Into<String>) -> Self {
        Self { broker, room: room.into() }
    }
}

impl Connector for LocalConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Link, ClientError>> {
        let conn = self.broker.connect_to(&self.room);
        Box::pin(async move {
            let (sender, inbound) = conn.into_split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
            tokio::spawn(async move {
                while let Some(event) = out_rx.recv().await {
                    if !sender.send(event) {
                        break;
                    }
                }
            });
            Ok(Link { outbound: out_tx, inbound })
        })
    }

    fn describe(&self) -> String {
        format!("local:{}", self.room)
    }
}
