//! Reconnecting chat client.
//!
//! ## Design
//! - [`ChatClient`] is a cheap front: operations check the published
//!   connection state and push events into the current link. They never wait
//!   on the network.
//! - A driver task owns the [`Reconnector`] state machine, the in-flight
//!   connect attempt, the inbound stream and the typing idle timer, and
//!   multiplexes them with `tokio::select!`.
//! - Inbound events and state changes are fanned out to [`Subscribers`] as
//!   [`ChatEvent`]s; one subscriber panicking never stops delivery to the rest.
//! - On every successful connect the driver sends `join_chat` with the cached
//!   display name, so a reconnect lands back in the room under the same name.

pub mod state;
pub mod subscribers;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::protocol::{ClientEvent, ServerEvent};

pub use crate::error::ClientError;
pub use state::{AfterFailure, ConnectionState, DeadlineAction, Reconnector};
pub use subscribers::{SubscriptionId, Subscribers};
pub use transport::{AutoConnector, Connector, Endpoints, Link, LocalConnector, PollingConnector, WsConnector};

/// Everything a subscriber can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Server(ServerEvent),
    Status(ConnectionState),
}

/// Identity and tuning for one client.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Preferred display name; `None` lets the broker generate one.
    pub username: Option<String>,
    pub is_admin: bool,
    pub admin_token: Option<String>,
    pub config: ClientConfig,
}

#[derive(Debug)]
enum DriverCommand {
    Reconnect,
    TypingActivity,
    Shutdown,
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    subscribers: Subscribers<ChatEvent>,
    username: Mutex<Option<String>>,
    is_admin: bool,
    admin_token: Option<String>,
    typing: AtomicBool,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn link(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<ClientEvent>>> {
        self.link.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn username(&self) -> MutexGuard<'_, Option<String>> {
        self.username.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish(&self, state: ConnectionState) {
        self.state.send_replace(state);
        info!(%state, "connection state changed");
        self.subscribers.dispatch(&ChatEvent::Status(state));
    }

    /// Send over the current link if connected.
    fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ClientError::NotConnected { state });
        }
        match self.link().as_ref() {
            Some(tx) => tx
                .send(event)
                .map_err(|_| ClientError::Transport("link closed".to_string())),
            None => Err(ClientError::NotConnected { state }),
        }
    }

    fn join_event(&self) -> ClientEvent {
        ClientEvent::JoinChat {
            username: self.username().clone(),
            is_admin: self.is_admin,
            admin_token: self.admin_token.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ChatClient
// ---------------------------------------------------------------------------

pub struct ChatClient {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<DriverCommand>,
}

impl ChatClient {
    /// Start connecting through `connector`. Must be called inside a tokio
    /// runtime; the first attempt begins immediately.
    pub fn start<C>(connector: C, options: ClientOptions) -> Self
    where
        C: Connector + 'static,
    {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            state: state_tx,
            link: Mutex::new(None),
            subscribers: Subscribers::new(),
            username: Mutex::new(options.username.filter(|n| !n.trim().is_empty())),
            is_admin: options.is_admin,
            admin_token: options.admin_token,
            typing: AtomicBool::new(false),
        });
        let (commands, rx) = mpsc::unbounded_channel();
        info!(target_url = %connector.describe(), "chat client starting");
        tokio::spawn(drive(Arc::clone(&shared), Arc::new(connector), options.config, rx));
        Self { shared, commands }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the client reaches `target`, or give up after `timeout`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.subscribers.unsubscribe(id)
    }

    /// Display name sent with the automatic join on every connect.
    pub fn preferred_username(&self) -> Option<String> {
        self.shared.username().clone()
    }

    // -- operations -----------------------------------------------------------

    /// Send `join_chat`. The driver already joins on every connect, so this
    /// is only needed to pick a name after a join was refused. The cached
    /// name changes only when the broker answers with `join_success`.
    pub fn join(&self, username: Option<&str>) -> Result<(), ClientError> {
        let requested = username
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| self.shared.username().clone());
        self.shared.emit(ClientEvent::JoinChat {
            username: requested,
            is_admin: self.shared.is_admin,
            admin_token: self.shared.admin_token.clone(),
        })
    }

    pub fn send(&self, content: &str) -> Result<(), ClientError> {
        self.shared.emit(ClientEvent::SendMessage { content: content.to_string() })?;
        // The broker clears the typing flag on a public send.
        self.shared.typing.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn send_private(&self, recipient_id: &str, content: &str) -> Result<(), ClientError> {
        self.shared.emit(ClientEvent::SendPrivateMessage {
            recipient_id: recipient_id.to_string(),
            content: content.to_string(),
        })
    }

    pub fn change_username(&self, new_username: &str) -> Result<(), ClientError> {
        self.shared.emit(ClientEvent::ChangeUsername { new_username: new_username.to_string() })
    }

    pub fn report(&self, message_id: &str) -> Result<(), ClientError> {
        self.shared.emit(ClientEvent::ReportMessage { message_id: message_id.to_string() })
    }

    /// Admin rights are checked by the broker, not here.
    pub fn block(&self, target_id: &str) -> Result<(), ClientError> {
        self.shared.emit(ClientEvent::BlockUser { user_id: target_id.to_string() })
    }

    pub fn unblock(&self, target_id: &str) -> Result<(), ClientError> {
        self.shared.emit(ClientEvent::UnblockUser { user_id: target_id.to_string() })
    }

    pub fn request_reports(&self) -> Result<(), ClientError> {
        self.shared.emit(ClientEvent::GetReports)
    }

    /// Mark this user as typing and arm the idle timer.
    pub fn start_typing(&self) -> Result<(), ClientError> {
        if !self.shared.typing.load(Ordering::SeqCst) {
            self.shared.emit(ClientEvent::TypingStart)?;
            self.shared.typing.store(true, Ordering::SeqCst);
        }
        let _ = self.commands.send(DriverCommand::TypingActivity);
        Ok(())
    }

    pub fn stop_typing(&self) -> Result<(), ClientError> {
        if self.shared.typing.swap(false, Ordering::SeqCst) {
            self.shared.emit(ClientEvent::TypingStop)?;
        }
        Ok(())
    }

    /// Call on every keystroke: starts typing if needed and pushes the idle
    /// deadline back.
    pub fn input_activity(&self) -> Result<(), ClientError> {
        self.start_typing()
    }

    /// Reset the retry budget and connect again, from any state.
    pub fn reconnect(&self) -> Result<(), ClientError> {
        self.commands
            .send(DriverCommand::Reconnect)
            .map_err(|_| ClientError::Closed)
    }

    /// Stop the driver and close the link.
    pub fn shutdown(&self) {
        let _ = self.commands.send(DriverCommand::Shutdown);
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

type PendingConnect = BoxFuture<'static, Result<Link, ClientError>>;

async fn drive(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
) {
    let mut fsm = Reconnector::new(&config);
    let mut inbound: Option<mpsc::UnboundedReceiver<ServerEvent>> = None;
    let mut typing_deadline: Option<Instant> = None;

    fsm.begin_connect(Instant::now());
    shared.publish(ConnectionState::Connecting);
    let mut pending: Option<PendingConnect> = Some(connector.connect());

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(DriverCommand::Shutdown) => break,
                Some(DriverCommand::Reconnect) => {
                    debug!("manual reconnect");
                    drop_link(&shared, &mut inbound);
                    fsm.reset(Instant::now());
                    shared.publish(ConnectionState::Connecting);
                    pending = Some(connector.connect());
                }
                Some(DriverCommand::TypingActivity) => {
                    typing_deadline = Some(Instant::now() + config.typing_idle());
                }
            },

            result = next_link(&mut pending) => {
                pending = None;
                match result {
                    Ok(link) => {
                        fsm.on_connected();
                        let join = shared.join_event();
                        let _ = link.outbound.send(join);
                        *shared.link() = Some(link.outbound);
                        inbound = Some(link.inbound);
                        shared.publish(ConnectionState::Connected);
                    }
                    Err(e) => {
                        warn!(error = %e, attempt = fsm.attempts(), "connect failed");
                        fail(&shared, &mut fsm, &mut inbound);
                    }
                }
            }

            event = next_event(&mut inbound) => match event {
                Some(event) => {
                    match &event {
                        ServerEvent::JoinSuccess { username, .. } => {
                            fsm.on_acknowledged();
                            *shared.username() = Some(username.clone());
                        }
                        ServerEvent::UsernameChangeSuccess { new_username, .. } => {
                            *shared.username() = Some(new_username.clone());
                        }
                        _ => {}
                    }
                    shared.subscribers.dispatch(&ChatEvent::Server(event));
                }
                None => {
                    warn!("connection lost");
                    fail(&shared, &mut fsm, &mut inbound);
                }
            },

            _ = sleep_until(fsm.deadline()) => match fsm.on_deadline(Instant::now()) {
                DeadlineAction::Connect => {
                    info!(attempt = fsm.attempts(), "reconnecting");
                    shared.publish(ConnectionState::Connecting);
                    pending = Some(connector.connect());
                }
                DeadlineAction::HandshakeTimedOut => {
                    pending = None;
                    warn!(error = %ClientError::HandshakeTimeout, "connect failed");
                    fail(&shared, &mut fsm, &mut inbound);
                }
                DeadlineAction::Nothing => {}
            },

            _ = sleep_until(typing_deadline) => {
                typing_deadline = None;
                if shared.typing.swap(false, Ordering::SeqCst) {
                    debug!("typing idle; sending typing_stop");
                    if let Some(tx) = shared.link().as_ref() {
                        let _ = tx.send(ClientEvent::TypingStop);
                    }
                }
            }
        }
    }

    drop_link(&shared, &mut inbound);
    info!("chat client stopped");
}

fn drop_link(shared: &Shared, inbound: &mut Option<mpsc::UnboundedReceiver<ServerEvent>>) {
    *shared.link() = None;
    *inbound = None;
    shared.typing.store(false, Ordering::SeqCst);
}

fn fail(shared: &Shared, fsm: &mut Reconnector, inbound: &mut Option<mpsc::UnboundedReceiver<ServerEvent>>) {
    drop_link(shared, inbound);
    match fsm.on_failure(Instant::now()) {
        AfterFailure::RetryAt(_) => shared.publish(ConnectionState::Disconnected),
        AfterFailure::Exhausted => {
            shared.publish(ConnectionState::Error);
            fsm.enter_fallback();
            shared.publish(ConnectionState::Fallback);
        }
    }
}

async fn next_link(pending: &mut Option<PendingConnect>) -> Result<Link, ClientError> {
    match pending {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_event(inbound: &mut Option<mpsc::UnboundedReceiver<ServerEvent>>) -> Option<ServerEvent> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChatBroker;
    use crate::config::ChatConfig;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            max_retries: 3,
            retry_delay_ms: 10,
            handshake_timeout_ms: 500,
            typing_idle_ms: 50,
        }
    }

    fn local_client(broker: &Arc<ChatBroker>, name: &str) -> ChatClient {
        ChatClient::start(
            LocalConnector::new(Arc::clone(broker), "general"),
            ClientOptions {
                username: Some(name.to_string()),
                config: fast_config(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn connects_and_joins_with_cached_name() {
        let broker = Arc::new(ChatBroker::new(ChatConfig::default()));
        let client = local_client(&broker, "Alice");
        assert!(client.wait_for_state(ConnectionState::Connected, Duration::from_secs(2)).await);

        let room = broker.room("general");
        let mut names = Vec::new();
        for _ in 0..50 {
            names = room.snapshot().await.unwrap().users.into_iter().map(|u| u.username).collect();
            if !names.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(names, vec!["Alice"]);
    }

    #[tokio::test]
    async fn operations_fail_locally_until_connected() {
        struct Never;
        impl Connector for Never {
            fn connect(&self) -> BoxFuture<'static, Result<Link, ClientError>> {
                Box::pin(std::future::pending())
            }
            fn describe(&self) -> String {
                "never".into()
            }
        }
        let client = ChatClient::start(Never, ClientOptions::default());
        assert_eq!(
            client.send("hi"),
            Err(ClientError::NotConnected { state: ConnectionState::Connecting })
        );
        assert!(matches!(client.block("x"), Err(ClientError::NotConnected { .. })));
        assert!(matches!(client.start_typing(), Err(ClientError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn typing_idle_timer_sends_stop() {
        let broker = Arc::new(ChatBroker::new(ChatConfig::default()));
        let client = local_client(&broker, "Typist");
        assert!(client.wait_for_state(ConnectionState::Connected, Duration::from_secs(2)).await);

        client.input_activity().unwrap();
        let room = broker.room("general");
        let mut typing = Vec::new();
        for _ in 0..20 {
            typing = room.snapshot().await.unwrap().typing;
            if !typing.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(typing, vec!["Typist"]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(room.snapshot().await.unwrap().typing.is_empty());
    }

    #[tokio::test]
    async fn rename_success_updates_cached_name() {
        let broker = Arc::new(ChatBroker::new(ChatConfig::default()));
        let client = local_client(&broker, "Old");
        assert!(client.wait_for_state(ConnectionState::Connected, Duration::from_secs(2)).await);
        client.change_username("New").unwrap();
        for _ in 0..100 {
            if client.preferred_username().as_deref() == Some("New") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(client.preferred_username().as_deref(), Some("New"));
    }

    #[tokio::test]
    async fn refused_join_keeps_cached_name() {
        let broker = Arc::new(ChatBroker::new(ChatConfig::default()));
        let client = local_client(&broker, "Alice");
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe(move |event| {
            if let ChatEvent::Server(event @ (ServerEvent::JoinSuccess { .. } | ServerEvent::Error { .. })) = event {
                let _ = tx.send(event.clone());
            }
        });
        assert!(client.wait_for_state(ConnectionState::Connected, Duration::from_secs(2)).await);
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(first, ServerEvent::JoinSuccess { .. }));

        client.join(Some("Zed")).unwrap();
        let refused = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(refused, ServerEvent::Error { ref code, .. } if code == "already_joined"));
        assert_eq!(client.preferred_username().as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn generated_name_is_cached_after_join_success() {
        let broker = Arc::new(ChatBroker::new(ChatConfig::default()));
        let client = ChatClient::start(
            LocalConnector::new(Arc::clone(&broker), "general"),
            ClientOptions { config: fast_config(), ..Default::default() },
        );
        assert_eq!(client.preferred_username(), None);
        assert!(client.wait_for_state(ConnectionState::Connected, Duration::from_secs(2)).await);
        for _ in 0..100 {
            if client.preferred_username().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let cached = client.preferred_username().expect("name cached after join");
        let users = broker.room("general").snapshot().await.unwrap().users;
        assert_eq!(users.into_iter().map(|u| u.username).collect::<Vec<_>>(), vec![cached]);
    }
}
