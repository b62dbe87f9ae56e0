//! Login, renewal and persistence over real HTTP
use std::sync::Arc;

use mockito::Server;
use serde_json::{json, Value};

use crawldash_lib::{
    ConnectionState, CoreEvent, ErrorCode, EventKind, FileBackend, MemoryBackend, SessionEndReason,
};

use crate::harness::{access_secret, build_core, test_config, wait_for_state, PushServer, WAIT};

fn grant(access_token: &str, refresh_token: &str) -> String {
    json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "user": {"username": "hana", "email": "hana@example.test"}
    })
    .to_string()
}

#[tokio::test]
async fn test_login_opens_channel_with_access_secret() {
    let mut api = Server::new_async().await;
    let mut push = PushServer::start().await;
    let access = access_secret("hana", 30);

    let login = api
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(grant(&access, "r-1"))
        .expect(1)
        .create_async()
        .await;

    let core = build_core(test_config(&api.url(), &push.url), Arc::new(MemoryBackend::new()));
    let mut events = core.subscribe();

    let identity = core.login("hana", "secret").await.unwrap().unwrap();
    assert_eq!(identity.display_name(), "hana");
    login.assert_async().await;

    let connection = push.next_connection().await;
    assert_eq!(connection.token().as_deref(), Some(access.as_str()));
    wait_for_state(&mut events, ConnectionState::Connected).await;
    core.shutdown().await;
}

#[tokio::test]
async fn test_rejected_login_keeps_core_logged_out() {
    let mut api = Server::new_async().await;
    let push = PushServer::start().await;
    let _login = api
        .mock("POST", "/auth/login")
        .with_status(401)
        .with_body(r#"{"detail":"invalid credentials"}"#)
        .create_async()
        .await;

    let core = build_core(test_config(&api.url(), &push.url), Arc::new(MemoryBackend::new()));
    let err = core.login("hana", "wrong").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::LoginFailed);
    assert!(!core.auth().is_authenticated().await);
    assert_eq!(core.connection().state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_concurrent_unauthorized_requests_renew_once() {
    let mut api = Server::new_async().await;
    let push = PushServer::start().await;
    let stale = access_secret("hana", 30);
    let fresh = access_secret("hana-renewed", 30);

    let _login = api
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_body(grant(&stale, "r-1"))
        .create_async()
        .await;
    let refresh = api
        .mock("POST", "/auth/refresh")
        .match_body(mockito::Matcher::PartialJson(json!({"refresh_token": "r-1"})))
        .with_status(200)
        .with_body(grant(&fresh, "r-2"))
        .expect(1)
        .create_async()
        .await;
    let rejected = api
        .mock("GET", "/tasks")
        .match_header("authorization", format!("Bearer {}", stale).as_str())
        .with_status(401)
        .expect_at_least(1)
        .create_async()
        .await;
    let accepted = api
        .mock("GET", "/tasks")
        .match_header("authorization", format!("Bearer {}", fresh).as_str())
        .with_status(200)
        .with_body(r#"[{"id": 1, "status": "running"}]"#)
        .expect(3)
        .create_async()
        .await;

    let core = Arc::new(build_core(
        test_config(&api.url(), &push.url),
        Arc::new(MemoryBackend::new()),
    ));
    core.login("hana", "secret").await.unwrap();

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let core = core.clone();
            tokio::spawn(async move { core.api().get_json::<Value>("/tasks").await })
        })
        .collect();
    for handle in handles {
        let tasks = handle.await.unwrap().unwrap();
        assert_eq!(tasks[0]["status"], "running");
    }

    refresh.assert_async().await;
    rejected.assert_async().await;
    accepted.assert_async().await;
    assert_eq!(
        core.store().credential().await.unwrap().refresh_secret.as_deref(),
        Some("r-2")
    );
    core.shutdown().await;
}

#[tokio::test]
async fn test_rejected_refresh_ends_session() {
    let mut api = Server::new_async().await;
    let push = PushServer::start().await;
    let stale = access_secret("hana", 30);

    let _login = api
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_body(grant(&stale, "r-1"))
        .create_async()
        .await;
    let _refresh = api
        .mock("POST", "/auth/refresh")
        .with_status(401)
        .with_body(r#"{"detail":"refresh token revoked"}"#)
        .expect(1)
        .create_async()
        .await;
    let _tasks = api
        .mock("GET", "/tasks")
        .with_status(401)
        .create_async()
        .await;

    let core = build_core(test_config(&api.url(), &push.url), Arc::new(MemoryBackend::new()));
    core.login("hana", "secret").await.unwrap();
    let mut events = core.subscribe();

    let err = core.api().get_json::<Value>("/tasks").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::SessionEnded);

    let ended = tokio::time::timeout(WAIT, events.recv_kind(&[EventKind::SessionEnded]))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        ended,
        CoreEvent::SessionEnded {
            reason: SessionEndReason::RenewalFailed(_)
        }
    ));
    assert!(!core.auth().is_authenticated().await);

    let err = core.api().get_json::<Value>("/tasks").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotAuthenticated);
}

#[tokio::test]
async fn test_session_survives_restart() {
    let mut api = Server::new_async().await;
    let mut push = PushServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let session_file = dir.path().join("session.json");
    let access = access_secret("hana", 30);

    let _login = api
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_body(grant(&access, "r-1"))
        .create_async()
        .await;

    let config = test_config(&api.url(), &push.url);
    {
        let first = build_core(config.clone(), Arc::new(FileBackend::new(&session_file)));
        first.login("hana", "secret").await.unwrap();
        let _connection = push.next_connection().await;
        first.shutdown().await;
    }
    assert!(session_file.exists());

    let second = build_core(config, Arc::new(FileBackend::new(&session_file)));
    let mut events = second.subscribe();
    let identity = second.restore().await.unwrap().unwrap();
    assert_eq!(identity.email.as_deref(), Some("hana@example.test"));

    let connection = push.next_connection().await;
    assert_eq!(connection.token().as_deref(), Some(access.as_str()));
    wait_for_state(&mut events, ConnectionState::Connected).await;

    second.logout().await;
    assert!(!session_file.exists());
    second.shutdown().await;
}
