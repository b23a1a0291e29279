mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use http::header::AUTHORIZATION;
use http::StatusCode;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use realm_api::gateway::Group;
use realm_api::AppState;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Helper: start an actual TCP server for WebSocket testing.
async fn start_ws_server(state: AppState) -> SocketAddr {
    let app = realm_api::routes::router().with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

async fn connect(addr: SocketAddr, token: &str) -> Ws {
    let url = format!("ws://{addr}/ws?token={token}");
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("ws connect");
    ws
}

async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(ws: &mut Ws) -> serde_json::Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for frame")
            .expect("stream ended")
            .expect("ws read error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("frame is JSON");
        }
    }
}

/// True if no text frame arrives within a short window.
async fn nothing_pending(ws: &mut Ws) -> bool {
    loop {
        match time::timeout(Duration::from_millis(200), ws.next()).await {
            Err(_) => return true,
            Ok(Some(Ok(Message::Text(_)))) => return false,
            Ok(Some(Ok(_))) => continue,
            Ok(_) => return true,
        }
    }
}

async fn wait_for_group_size(state: &AppState, group: Group, expected: usize) {
    let deadline = time::Instant::now() + Duration::from_secs(5);
    while state.hub.group_size(group.clone()).await != expected {
        assert!(time::Instant::now() < deadline, "group {group:?} never reached {expected}");
        time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_connections(state: &AppState, expected: usize) {
    let deadline = time::Instant::now() + Duration::from_secs(5);
    while state.hub.stats().await.connections != expected {
        assert!(time::Instant::now() < deadline, "connection count never reached {expected}");
        time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upgrade_without_token_is_unauthorized() {
    let state = common::test_state();
    let addr = start_ws_server(state.clone()).await;

    let Err(err) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await else {
        panic!("upgrade must fail");
    };
    match err {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), StatusCode::UNAUTHORIZED),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(state.hub.stats().await.connections, 0);
}

#[tokio::test]
async fn upgrade_with_revoked_token_is_unauthorized() {
    let state = common::test_state();
    let addr = start_ws_server(state.clone()).await;
    let (access, _) = common::login(&state, "usr_alice").await;
    state.tokens.revoke_access_token(&access).await.unwrap();

    let Err(err) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token={access}")).await else {
        panic!("upgrade must fail");
    };
    assert!(matches!(err, tungstenite::Error::Http(ref resp) if resp.status() == StatusCode::UNAUTHORIZED));
}

#[tokio::test]
async fn upgrade_accepts_bearer_header() {
    let state = common::test_state();
    let addr = start_ws_server(state.clone()).await;
    let (access, _) = common::login(&state, "usr_alice").await;

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(AUTHORIZATION, format!("Bearer {access}").parse().unwrap());
    let (_ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");

    wait_for_connections(&state, 1).await;
}

// ---------------------------------------------------------------------------
// Groups and fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn typing_fans_out_to_channel_members() {
    let state = common::test_state();
    let addr = start_ws_server(state.clone()).await;
    let (alice_token, _) = common::login(&state, "usr_alice").await;
    let (bob_token, _) = common::login(&state, "usr_bob").await;

    let mut alice = connect(addr, &alice_token).await;
    let mut bob = connect(addr, &bob_token).await;
    for ws in [&mut alice, &mut bob] {
        send_json(ws, serde_json::json!({ "type": "join_channel", "channel_id": "general" })).await;
    }
    wait_for_group_size(&state, Group::channel("general"), 2).await;

    send_json(
        &mut alice,
        serde_json::json!({ "type": "typing_start", "channel_id": "general" }),
    )
    .await;

    for ws in [&mut alice, &mut bob] {
        let event = next_json(ws).await;
        assert_eq!(event["type"], "typing");
        assert_eq!(event["channel_id"], "general");
        assert_eq!(event["data"]["user_id"], "usr_alice");
        assert_eq!(event["data"]["is_typing"], true);
    }

    // Alice leaves; only Bob hears what follows.
    alice.close(None).await.unwrap();
    wait_for_group_size(&state, Group::channel("general"), 1).await;
    wait_for_connections(&state, 1).await;

    state
        .hub
        .publish_to_channel("general", r#"{"type":"message","data":{"body":"hi"}}"#);
    let event = next_json(&mut bob).await;
    assert_eq!(event["type"], "message");
    assert_eq!(event["data"]["body"], "hi");
}

#[tokio::test]
async fn user_publish_reaches_every_session() {
    let state = common::test_state();
    let addr = start_ws_server(state.clone()).await;
    let (token, _) = common::login(&state, "usr_alice").await;
    let (other, _) = common::login(&state, "usr_bob").await;

    let mut phone = connect(addr, &token).await;
    let mut laptop = connect(addr, &token).await;
    let mut bob = connect(addr, &other).await;
    wait_for_connections(&state, 3).await;

    state.hub.publish_to_user("usr_alice", r#"{"type":"notice","data":{}}"#);

    assert_eq!(next_json(&mut phone).await["type"], "notice");
    assert_eq!(next_json(&mut laptop).await["type"], "notice");
    assert!(nothing_pending(&mut bob).await);
}

#[tokio::test]
async fn leave_realm_stops_delivery() {
    let state = common::test_state();
    let addr = start_ws_server(state.clone()).await;
    let (token, _) = common::login(&state, "usr_alice").await;
    let mut ws = connect(addr, &token).await;

    send_json(&mut ws, serde_json::json!({ "type": "join_realm", "realm_id": "rlm_1" })).await;
    wait_for_group_size(&state, Group::realm("rlm_1"), 1).await;
    send_json(&mut ws, serde_json::json!({ "type": "leave_realm", "realm_id": "rlm_1" })).await;
    wait_for_group_size(&state, Group::realm("rlm_1"), 0).await;

    state.hub.publish_to_realm("rlm_1", r#"{"type":"realm_update","data":{}}"#);
    assert!(nothing_pending(&mut ws).await);
}

#[tokio::test]
async fn undecodable_frames_do_not_close_the_connection() {
    let state = common::test_state();
    let addr = start_ws_server(state.clone()).await;
    let (token, _) = common::login(&state, "usr_alice").await;
    let mut ws = connect(addr, &token).await;

    ws.send(Message::Text("definitely not json".to_string().into())).await.unwrap();
    send_json(&mut ws, serde_json::json!({ "type": "mystery" })).await;
    send_json(&mut ws, serde_json::json!({ "type": "join_channel", "channel_id": "general" })).await;

    wait_for_group_size(&state, Group::channel("general"), 1).await;
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn silent_client_is_dropped_after_idle_timeout() {
    let mut config = common::test_config();
    config.ping_interval_secs = 1;
    let state = common::test_state_with(config, std::sync::Arc::new(realm_api::db::kv::MemoryStore::new()));
    let addr = start_ws_server(state.clone()).await;
    let (token, _) = common::login(&state, "usr_alice").await;

    // Never polled, so pings go unanswered.
    let _ws = connect(addr, &token).await;
    wait_for_connections(&state, 1).await;

    let deadline = time::Instant::now() + Duration::from_secs(6);
    while state.hub.stats().await.connections != 0 {
        assert!(time::Instant::now() < deadline, "idle connection was never dropped");
        time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn hub_shutdown_closes_open_sockets() {
    let state = common::test_state();
    let addr = start_ws_server(state.clone()).await;
    let (token, _) = common::login(&state, "usr_alice").await;
    let mut ws = connect(addr, &token).await;
    wait_for_connections(&state, 1).await;

    state.hub.shutdown();

    loop {
        match time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("socket was never closed")
        {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => continue,
        }
    }
}
