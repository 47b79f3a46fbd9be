//! Client reconnection: losing the transport, exhausting retries, falling
//! back, and recovering through a manual reconnect. Links that open but
//! drop before the join is acknowledged count against the retry budget.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use tavern_chat::client::{
    ChatClient, ChatEvent, ClientError, ClientOptions, ConnectionState, Connector, Link, LocalConnector,
};
use tavern_chat::{ChatBroker, ChatConfig, ClientConfig, ClientEvent, ServerEvent};

fn fast_config() -> ClientConfig {
    ClientConfig {
        max_retries: 3,
        retry_delay_ms: 20,
        handshake_timeout_ms: 500,
        typing_idle_ms: 100,
    }
}

/// Succeeds on the first attempt only; the test can sever that link.
#[derive(Default)]
struct FlakyConnector {
    attempts: Arc<AtomicUsize>,
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<ServerEvent>>>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>>,
}

impl Connector for FlakyConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Link, ClientError>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt > 0 {
            return Box::pin(async { Err(ClientError::Transport("connection refused".into())) });
        }
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(in_tx);
        *self.outbound.lock().unwrap() = Some(out_rx);
        Box::pin(async move { Ok(Link { outbound: out_tx, inbound: in_rx }) })
    }

    fn describe(&self) -> String {
        "flaky".into()
    }
}

fn record_states(client: &ChatClient) -> Arc<Mutex<Vec<ConnectionState>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    client.subscribe(move |event| {
        if let ChatEvent::Status(state) = event {
            sink.lock().unwrap().push(*state);
        }
    });
    states
}

#[tokio::test]
async fn test_lost_transport_retries_three_times_then_falls_back() {
    let connector = FlakyConnector::default();
    let attempts = Arc::clone(&connector.attempts);
    let inbound = Arc::clone(&connector.inbound);
    let outbound = Arc::clone(&connector.outbound);

    let client = ChatClient::start(
        connector,
        ClientOptions {
            username: Some("Alice".into()),
            config: fast_config(),
            ..Default::default()
        },
    );
    assert!(client.wait_for_state(ConnectionState::Connected, Duration::from_secs(2)).await);
    let states = record_states(&client);

    // The first thing sent on a fresh link is a join with the cached name.
    let first = outbound.lock().unwrap().as_mut().unwrap().try_recv().unwrap();
    assert_eq!(
        first,
        ClientEvent::JoinChat { username: Some("Alice".into()), is_admin: false, admin_token: None }
    );

    inbound.lock().unwrap().take();
    assert!(client.wait_for_state(ConnectionState::Fallback, Duration::from_secs(3)).await);

    assert_eq!(attempts.load(Ordering::SeqCst), 4, "initial connect plus three retries");
    let seen = states.lock().unwrap().clone();
    use ConnectionState::*;
    assert_eq!(
        seen,
        vec![
            Disconnected, Connecting,
            Disconnected, Connecting,
            Disconnected, Connecting,
            Error, Fallback,
        ]
    );

    assert_eq!(client.send("anyone?"), Err(ClientError::NotConnected { state: Fallback }));

    states.lock().unwrap().clear();
    client.reconnect().unwrap();
    for _ in 0..300 {
        if attempts.load(Ordering::SeqCst) == 8 && client.state() == Fallback {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 8, "retry budget was reset");
    let seen = states.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&Connecting));
    assert_eq!(seen.last(), Some(&Fallback));
}

#[tokio::test]
async fn test_reconnect_rejoins_under_renamed_name() {
    let broker = Arc::new(ChatBroker::new(ChatConfig::default()));
    let client = ChatClient::start(
        LocalConnector::new(Arc::clone(&broker), "general"),
        ClientOptions {
            username: Some("Alice".into()),
            config: fast_config(),
            ..Default::default()
        },
    );
    assert!(client.wait_for_state(ConnectionState::Connected, Duration::from_secs(2)).await);

    let renamed = Arc::new(tokio::sync::Notify::new());
    let notify = Arc::clone(&renamed);
    client.subscribe(move |event| {
        if let ChatEvent::Server(ServerEvent::UsernameChangeSuccess { .. }) = event {
            notify.notify_one();
        }
    });

    // Give the join a moment to land before renaming.
    let room = broker.room("general");
    for _ in 0..100 {
        if room.snapshot().await.unwrap().users.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    client.change_username("Alicia").unwrap();
    tokio::time::timeout(Duration::from_secs(2), renamed.notified()).await.unwrap();
    assert_eq!(client.preferred_username().as_deref(), Some("Alicia"));

    client.reconnect().unwrap();

    let mut names = Vec::new();
    for _ in 0..100 {
        names = room
            .snapshot()
            .await
            .unwrap()
            .users
            .into_iter()
            .map(|u| u.username)
            .collect::<Vec<_>>();
        if names == ["Alicia"] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(names, vec!["Alicia"]);
}

#[tokio::test]
async fn test_panicking_subscriber_does_not_stop_delivery() {
    let broker = Arc::new(ChatBroker::new(ChatConfig::default()));
    let client = ChatClient::start(
        LocalConnector::new(Arc::clone(&broker), "general"),
        ClientOptions {
            username: Some("Alice".into()),
            config: fast_config(),
            ..Default::default()
        },
    );
    client.subscribe(|_| panic!("bad subscriber"));
    let joined = Arc::new(tokio::sync::Notify::new());
    let notify = Arc::clone(&joined);
    client.subscribe(move |event| {
        if let ChatEvent::Server(ServerEvent::JoinSuccess { .. }) = event {
            notify.notify_one();
        }
    });

    tokio::time::timeout(Duration::from_secs(2), joined.notified()).await.unwrap();
}

/// Every attempt opens a link that is gone before the broker can answer.
#[derive(Default)]
struct FlappingConnector {
    attempts: Arc<AtomicUsize>,
}

impl Connector for FlappingConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Link, ClientError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (_in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        Box::pin(async move { Ok(Link { outbound: out_tx, inbound: in_rx }) })
    }

    fn describe(&self) -> String {
        "flapping".into()
    }
}

#[tokio::test]
async fn test_links_that_drop_before_join_still_fall_back() {
    let connector = FlappingConnector::default();
    let attempts = Arc::clone(&connector.attempts);
    let client = ChatClient::start(
        connector,
        ClientOptions {
            username: Some("Alice".into()),
            config: fast_config(),
            ..Default::default()
        },
    );

    assert!(
        client.wait_for_state(ConnectionState::Fallback, Duration::from_secs(3)).await,
        "a server that never acknowledges the join must exhaust the retry budget"
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 4, "initial connect plus three retries");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 4, "no retries after fallback");
}
