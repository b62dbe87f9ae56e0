//! Push channel behaviour against a real WebSocket server
use std::sync::Arc;

use mockito::{Mock, Server, ServerGuard};
use serde_json::{json, Value};

use crawldash_lib::{ConnectionState, CoreEvent, EventKind, MemoryBackend, SessionCore, Topic};

use crate::harness::{access_secret, build_core, test_config, wait_for_state, PushServer, ServerConnection, WAIT};

/// A logged-in core plus the first connection it opened; keep the mock alive
async fn logged_in(api: &mut ServerGuard, push: &mut PushServer) -> (SessionCore, ServerConnection, Mock) {
    let login = api
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_body(
            json!({
                "access_token": access_secret("ines", 30),
                "refresh_token": "r",
                "user": {"username": "ines"}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let core = build_core(test_config(&api.url(), &push.url), Arc::new(MemoryBackend::new()));
    let mut events = core.subscribe();
    core.login("ines", "pw").await.unwrap();
    let connection = push.next_connection().await;
    wait_for_state(&mut events, ConnectionState::Connected).await;
    (core, connection, login)
}

fn frame(text: &str) -> Value {
    serde_json::from_str(text).unwrap()
}

#[tokio::test]
async fn test_subscriptions_are_replayed_after_connection_loss() {
    let mut api = Server::new_async().await;
    let mut push = PushServer::start().await;
    let (core, mut first, _login) = logged_in(&mut api, &mut push).await;
    let mut events = core.subscribe();

    assert!(core.subscribe_task(5).await);
    assert!(core.subscribe_all_tasks().await);
    let sent = frame(&first.next_text().await);
    assert_eq!(sent["type"], "subscribe");
    assert_eq!(sent["data"]["topic"], "crawl_task:5");
    first.next_text().await;

    first.drop_connection();
    wait_for_state(&mut events, ConnectionState::Reconnecting).await;

    let mut second = push.next_connection().await;
    let mut replayed = vec![
        frame(&second.next_text().await)["data"]["topic"].clone(),
        frame(&second.next_text().await)["data"]["topic"].clone(),
    ];
    replayed.sort_by_key(|topic| topic.to_string());
    assert_eq!(replayed, vec![json!("crawl_task:5"), json!("crawl_tasks:all")]);
    wait_for_state(&mut events, ConnectionState::Connected).await;
    assert_eq!(
        core.connection().topics().await,
        vec![Topic::task(5), Topic::all_tasks()]
    );

    second.send(r#"{"type":"task_completed","task_id":5,"data":{"pages":120}}"#);
    let event = tokio::time::timeout(WAIT, events.recv_kind(&[EventKind::TaskCompleted]))
        .await
        .unwrap()
        .unwrap();
    match event {
        CoreEvent::TaskCompleted(update) => {
            assert_eq!(update.task_id, Some(5));
            assert_eq!(update.data["pages"], 120);
        }
        other => panic!("unexpected event {:?}", other),
    }
    core.shutdown().await;
}

#[tokio::test]
async fn test_raw_message_precedes_typed_event() {
    let mut api = Server::new_async().await;
    let mut push = PushServer::start().await;
    let (core, connection, _login) = logged_in(&mut api, &mut push).await;
    let mut events = core.subscribe();

    connection.send(r#"{"type":"task_failed","data":{"task_id":9,"error":"robots.txt"}}"#);
    connection.send(r#"{"type":"error","data":{"message":"quota exceeded"}}"#);

    let mut kinds = Vec::new();
    tokio::time::timeout(WAIT, async {
        while kinds.len() < 4 {
            let event = events.recv().await.unwrap();
            if event.kind() != EventKind::ConnectionStateChanged {
                kinds.push(event);
            }
        }
    })
    .await
    .unwrap();

    assert!(matches!(kinds[0], CoreEvent::Message(_)));
    assert!(matches!(kinds[1], CoreEvent::TaskFailed(ref update) if update.task_id == Some(9)));
    assert!(matches!(kinds[2], CoreEvent::Message(_)));
    assert_eq!(
        kinds[3],
        CoreEvent::ServerError {
            message: "quota exceeded".to_string()
        }
    );
    assert_eq!(core.connection().state().await, ConnectionState::Connected);
    core.shutdown().await;
}

#[tokio::test]
async fn test_logout_closes_channel_and_forgets_topics() {
    let mut api = Server::new_async().await;
    let mut push = PushServer::start().await;
    let (core, mut connection, _login) = logged_in(&mut api, &mut push).await;
    let mut events = core.subscribe();
    core.subscribe_task(3).await;

    core.logout().await;
    wait_for_state(&mut events, ConnectionState::Disconnected).await;

    // The server sees the subscribe, then the close ends the stream
    let closed = tokio::time::timeout(WAIT, async {
        while connection.received.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok());

    tokio::time::timeout(WAIT, async {
        while !core.connection().topics().await.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!core.auth().is_authenticated().await);
}
