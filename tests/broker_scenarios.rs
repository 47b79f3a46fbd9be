//! End-to-end broker scenarios through the room actor: public chat, rename
//! conflicts, blocking across reconnects and message length limits.

use std::time::Duration;

use tavern_chat::{BrokerConnection, ChatBroker, ChatConfig, ClientEvent, Message, MessageKind, ServerEvent};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn broker() -> ChatBroker {
    ChatBroker::new(ChatConfig::default())
}

fn join_event(name: &str, admin: bool) -> ClientEvent {
    ClientEvent::JoinChat {
        username: Some(name.to_string()),
        is_admin: admin,
        admin_token: None,
    }
}

/// Connect, join and wait for `join_success`.
async fn joined(broker: &ChatBroker, name: &str, admin: bool) -> BrokerConnection {
    let mut conn = broker.connect();
    assert!(conn.send(join_event(name, admin)));
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), conn.recv())
            .await
            .expect("timed out waiting for join_success")
            .expect("connection closed");
        if matches!(event, ServerEvent::JoinSuccess { .. }) {
            return conn;
        }
    }
}

/// Wait until the default room has applied everything queued so far.
async fn settle(broker: &ChatBroker) {
    broker.room("general").snapshot().await.expect("room stopped");
}

fn drain(conn: &mut BrokerConnection) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Some(event) = conn.try_recv() {
        events.push(event);
    }
    events
}

fn error_codes(events: &[ServerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::Error { code, .. } => Some(code.clone()),
            _ => None,
        })
        .collect()
}

fn new_messages(events: &[ServerEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::NewMessage(m) => Some((m.sender_name.clone(), m.content.clone())),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_public_message_reaches_both_sessions() {
    let broker = broker();
    let mut alice = joined(&broker, "Alice", false).await;
    let mut bob = joined(&broker, "Bob", false).await;
    drain(&mut alice);
    drain(&mut bob);

    alice.send(ClientEvent::SendMessage { content: "hello".into() });
    settle(&broker).await;

    let expected = vec![("Alice".to_string(), "hello".to_string())];
    assert_eq!(new_messages(&drain(&mut alice)), expected);
    assert_eq!(new_messages(&drain(&mut bob)), expected);
}

#[tokio::test]
async fn test_rename_to_live_name_is_conflict() {
    let broker = broker();
    let _alice = joined(&broker, "Alice", false).await;
    let mut bob = joined(&broker, "Bob", false).await;
    drain(&mut bob);

    bob.send(ClientEvent::ChangeUsername { new_username: "Alice".into() });
    settle(&broker).await;

    assert_eq!(error_codes(&drain(&mut bob)), vec!["name_taken"]);
    let snap = broker.room("general").snapshot().await.unwrap();
    let names: Vec<String> = snap.users.into_iter().map(|u| u.username).collect();
    assert_eq!(names, vec!["Alice", "Bob"]);
}

#[tokio::test]
async fn test_block_is_per_connection_and_lost_on_reconnect() {
    let broker = broker();
    let mut admin = joined(&broker, "Admin", true).await;
    let mut bob = joined(&broker, "Bob", false).await;
    drain(&mut admin);
    drain(&mut bob);

    admin.send(ClientEvent::BlockUser { user_id: bob.id().to_string() });
    settle(&broker).await;
    let to_bob = drain(&mut bob);
    assert!(to_bob.iter().any(|e| matches!(e, ServerEvent::UserBlocked { .. })));
    assert!(drain(&mut admin).iter().any(|e| matches!(e, ServerEvent::BlockSuccess { .. })));

    bob.send(ClientEvent::SendMessage { content: "let me in".into() });
    settle(&broker).await;
    assert_eq!(error_codes(&drain(&mut bob)), vec!["blocked"]);

    let old_id = bob.id().to_string();
    drop(bob);
    let mut bob = joined(&broker, "Bob", false).await;
    assert_ne!(bob.id(), old_id);
    drain(&mut bob);

    bob.send(ClientEvent::SendMessage { content: "I'm back".into() });
    settle(&broker).await;
    let events = drain(&mut bob);
    assert!(error_codes(&events).is_empty());
    assert_eq!(new_messages(&events), vec![("Bob".to_string(), "I'm back".to_string())]);

    let snap = broker.room("general").snapshot().await.unwrap();
    assert_eq!(snap.blocked_count, 1, "the old id stays blocked");
}

#[tokio::test]
async fn test_message_length_boundary() {
    let broker = broker();
    let mut alice = joined(&broker, "Alice", false).await;
    drain(&mut alice);

    alice.send(ClientEvent::SendMessage { content: "a".repeat(501) });
    alice.send(ClientEvent::SendMessage { content: "b".repeat(500) });
    settle(&broker).await;

    let events = drain(&mut alice);
    assert_eq!(error_codes(&events), vec!["too_long"]);
    let accepted = new_messages(&events);
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].1.chars().count(), 500);
}

// ---------------------------------------------------------------------------
// Additional broker behaviour
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_every_member_sees_the_same_order() {
    let broker = broker();
    let mut alice = joined(&broker, "Alice", false).await;
    let mut bob = joined(&broker, "Bob", false).await;
    let mut carol = joined(&broker, "Carol", false).await;
    drain(&mut alice);
    drain(&mut bob);
    drain(&mut carol);

    for i in 0..10 {
        alice.send(ClientEvent::SendMessage { content: format!("a{i}") });
        bob.send(ClientEvent::SendMessage { content: format!("b{i}") });
    }
    settle(&broker).await;

    let seen_a = new_messages(&drain(&mut alice));
    let seen_b = new_messages(&drain(&mut bob));
    let seen_c = new_messages(&drain(&mut carol));
    assert_eq!(seen_a.len(), 20);
    assert_eq!(seen_a, seen_b);
    assert_eq!(seen_b, seen_c);
}

#[tokio::test]
async fn test_late_joiner_gets_history_with_original_sender_names() {
    let broker = broker();
    let alice = joined(&broker, "Alice", false).await;
    alice.send(ClientEvent::SendMessage { content: "first".into() });
    alice.send(ClientEvent::ChangeUsername { new_username: "Alicia".into() });
    alice.send(ClientEvent::SendMessage { content: "second".into() });
    settle(&broker).await;

    let mut dave = broker.connect();
    dave.send(join_event("Dave", false));
    settle(&broker).await;
    let history = drain(&mut dave)
        .into_iter()
        .find_map(|e| match e {
            ServerEvent::MessageHistory { messages } => Some(messages),
            _ => None,
        })
        .expect("history replay");
    let senders: Vec<&str> = history.iter().map(|m| m.sender_name.as_str()).collect();
    assert_eq!(senders, vec!["Alice", "Alicia"]);
    assert!(history.iter().all(|m| m.kind == MessageKind::Public));
}

#[tokio::test]
async fn test_history_replays_the_exact_broadcast_messages() {
    let broker = broker();
    let mut alice = joined(&broker, "Alice", false).await;
    drain(&mut alice);
    for content in ["one", "two", "three"] {
        alice.send(ClientEvent::SendMessage { content: content.into() });
    }
    settle(&broker).await;
    let broadcast: Vec<Message> = drain(&mut alice)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::NewMessage(m) => Some(m),
            _ => None,
        })
        .collect();
    assert_eq!(broadcast.len(), 3);

    let mut bob = broker.connect();
    bob.send(join_event("Bob", false));
    settle(&broker).await;
    let replayed = drain(&mut bob)
        .into_iter()
        .find_map(|e| match e {
            ServerEvent::MessageHistory { messages } => Some(messages),
            _ => None,
        })
        .expect("history replay");
    assert_eq!(replayed, broadcast);
}

#[tokio::test]
async fn test_private_message_not_seen_by_third_party() {
    let broker = broker();
    let mut alice = joined(&broker, "Alice", false).await;
    let mut bob = joined(&broker, "Bob", false).await;
    let mut eve = joined(&broker, "Eve", false).await;
    drain(&mut alice);
    drain(&mut bob);
    drain(&mut eve);

    alice.send(ClientEvent::SendPrivateMessage {
        recipient_id: bob.id().to_string(),
        content: "secret".into(),
    });
    settle(&broker).await;

    let is_pm = |e: &ServerEvent| matches!(e, ServerEvent::PrivateMessage(m) if m.content == "secret");
    assert!(drain(&mut alice).iter().any(is_pm));
    assert!(drain(&mut bob).iter().any(is_pm));
    assert!(drain(&mut eve).is_empty());
}

#[tokio::test]
async fn test_reports_reach_admins_and_can_be_listed() {
    let broker = broker();
    let mut admin = joined(&broker, "Admin", true).await;
    let mut bob = joined(&broker, "Bob", false).await;
    drain(&mut admin);

    bob.send(ClientEvent::ReportMessage { message_id: "1700000000000-abc".into() });
    admin.send(ClientEvent::GetReports);
    bob.send(ClientEvent::GetReports);
    settle(&broker).await;

    let to_admin = drain(&mut admin);
    assert!(to_admin.iter().any(|e| matches!(e,
        ServerEvent::MessageReported { reported_by, .. } if reported_by == "Bob")));
    assert!(to_admin.iter().any(|e| matches!(e,
        ServerEvent::Reports { reports } if reports.len() == 1)));

    let to_bob = drain(&mut bob);
    assert!(to_bob.iter().any(|e| matches!(e, ServerEvent::ReportSuccess { .. })));
    assert!(error_codes(&to_bob).contains(&"not_admin".to_string()));
}

#[tokio::test]
async fn test_malformed_sequence_before_join_is_rejected() {
    let broker = broker();
    let mut ghost = broker.connect();
    ghost.send(ClientEvent::SendMessage { content: "boo".into() });
    settle(&broker).await;
    assert_eq!(error_codes(&drain(&mut ghost)), vec!["not_joined"]);
    assert_eq!(broker.room("general").snapshot().await.unwrap().history_len, 0);
}

#[tokio::test]
async fn test_session_cap() {
    let broker = ChatBroker::new(ChatConfig { max_sessions: Some(2), ..Default::default() });
    let _a = joined(&broker, "A", false).await;
    let _b = joined(&broker, "B", false).await;
    let mut c = broker.connect();
    c.send(join_event("C", false));
    settle(&broker).await;
    assert_eq!(error_codes(&drain(&mut c)), vec!["too_many_sessions"]);
}
