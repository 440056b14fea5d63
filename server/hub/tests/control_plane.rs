//! End-to-end control-plane behavior over real sockets.

mod common;

use common::{spawn_hub, users_set, TestClient};
use hub_proto::types::{Message, MessageType};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn login_fans_out_users_list() {
    let hub = spawn_hub().await;

    let mut c1 = TestClient::connect(hub.control).await;
    c1.login("alice", "pw1", true).await;
    let list = c1.recv_kind(MessageType::UsersListResponse).await;
    assert_eq!(users_set(&list), ["alice"]);

    let mut c2 = TestClient::connect(hub.control).await;
    c2.login("bob", "pw2", true).await;
    let list2 = c2.recv_kind(MessageType::UsersListResponse).await;
    assert_eq!(users_set(&list2), ["alice", "bob"]);

    // The earlier connection observes the update too.
    let list1 = c1.recv_kind(MessageType::UsersListResponse).await;
    assert_eq!(users_set(&list1), ["alice", "bob"]);
}

#[tokio::test]
async fn chat_echo_includes_sender_and_lands_in_history() {
    let hub = spawn_hub().await;
    let mut c1 = TestClient::connect(hub.control).await;
    c1.login("alice", "pw1", true).await;
    let mut c2 = TestClient::connect(hub.control).await;
    c2.login("bob", "pw2", true).await;

    c1.send_kind(MessageType::ChatMessage, &b"hi"[..]).await;

    for client in [&mut c1, &mut c2] {
        let msg = client.recv_kind(MessageType::ChatMessage).await;
        assert_eq!(msg.sender.as_deref(), Some("alice"));
        assert_eq!(msg.payload_bytes(), b"hi");
        let now = chrono::Utc::now().timestamp_millis();
        assert!((now - msg.timestamp_ms).abs() < 1_000, "timestamp not server-stamped");
    }

    assert!(hub.state.history.snapshot().contains(&"alice: hi".to_string()));

    // History replay carries the line back.
    c2.send_kind(MessageType::HistoryRequest, &b""[..]).await;
    let history = c2.recv_kind(MessageType::HistoryResponse).await;
    assert!(history.text_payload().contains("alice: hi"));
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected_without_close() {
    let hub = spawn_hub().await;
    let mut c = TestClient::connect(hub.control).await;

    c.send_kind(MessageType::ChatMessage, &b"hi"[..]).await;
    let err = c.recv().await;
    assert_eq!(err.message_type(), Some(MessageType::Error));
    assert_eq!(err.payload_bytes(), b"Not authenticated");

    // The connection survives and can still log in.
    c.login("alice", "pw1", true).await;
}

#[tokio::test]
async fn invalid_credentials_are_rejected() {
    let hub = spawn_hub().await;
    let mut c1 = TestClient::connect(hub.control).await;
    c1.login("alice", "pw1", true).await;

    let mut c2 = TestClient::connect(hub.control).await;
    c2.send_kind(
        MessageType::LoginRequest,
        r#"{"username":"alice","password":"wrong","register":false}"#,
    )
    .await;
    let err = c2.recv().await;
    assert_eq!(err.message_type(), Some(MessageType::Error));
    assert_eq!(err.payload_bytes(), b"Invalid credentials");

    let mut c3 = TestClient::connect(hub.control).await;
    c3.send_kind(
        MessageType::LoginRequest,
        r#"{"username":"alice","password":"pw1","register":true}"#,
    )
    .await;
    let err = c3.recv().await;
    assert_eq!(err.payload_bytes(), b"User already exists");
}

#[tokio::test]
async fn unknown_tags_get_an_error_reply() {
    let hub = spawn_hub().await;
    let mut c = TestClient::connect(hub.control).await;
    let mut msg = Message::new(MessageType::Ping);
    msg.kind = 99;
    c.send(&msg).await;
    let err = c.recv().await;
    assert_eq!(err.message_type(), Some(MessageType::Error));
    assert_eq!(err.payload_bytes(), b"Unsupported message type");
}

#[tokio::test]
async fn malformed_frame_is_answered_and_stream_recovers() {
    let hub = spawn_hub().await;
    let mut c = TestClient::connect(hub.control).await;

    // Well-delimited frame whose body is garbage.
    let mut raw = Message::new(MessageType::Ping);
    raw.kind = 3;
    let mut wire = hub_proto::frame::encode(&raw).to_vec();
    wire.truncate(6); // cut inside the sender field
    wire[3] = 2; // fix the length prefix to match the truncated body
    c.send_raw(&wire).await;

    let err = c.recv().await;
    assert_eq!(err.message_type(), Some(MessageType::Error));
    assert_eq!(err.payload_bytes(), b"Malformed message");

    // Frames after the bad one still parse.
    c.login("alice", "pw1", true).await;
}

#[tokio::test]
async fn ping_answers_pong_with_echoed_nonce() {
    let hub = spawn_hub().await;
    let mut c = TestClient::connect(hub.control).await;
    c.login("alice", "pw1", true).await;

    c.send_kind(MessageType::Ping, &b"nonce-77"[..]).await;
    let pong = c.recv_kind(MessageType::Pong).await;
    assert_eq!(pong.sender.as_deref(), Some("server"));
    assert_eq!(pong.payload_bytes(), b"nonce-77");
}

#[tokio::test]
async fn screen_stop_is_broadcast_on_disconnect() {
    let hub = spawn_hub().await;
    let mut alice = TestClient::connect(hub.control).await;
    alice.login("alice", "pw1", true).await;
    let mut bob = TestClient::connect(hub.control).await;
    bob.login("bob", "pw2", true).await;

    alice
        .send_kind(MessageType::MediaControl, r#"{"kind":"screen","state":"start"}"#)
        .await;

    let start = bob.recv_kind(MessageType::MediaControl).await;
    assert_eq!(start.sender.as_deref(), Some("alice"));
    let body: serde_json::Value = serde_json::from_slice(start.payload_bytes()).unwrap();
    assert_eq!(body["kind"], "screen");
    assert_eq!(body["state"], "start");

    drop(alice);

    let stop = bob.recv_kind(MessageType::MediaControl).await;
    assert_eq!(stop.sender.as_deref(), Some("alice"));
    let body: serde_json::Value = serde_json::from_slice(stop.payload_bytes()).unwrap();
    assert_eq!(body["state"], "stop");

    let list = bob.recv_kind(MessageType::UsersListResponse).await;
    assert_eq!(users_set(&list), ["bob"]);
}

#[tokio::test]
async fn late_joiner_receives_media_snapshot() {
    let hub = spawn_hub().await;
    let mut alice = TestClient::connect(hub.control).await;
    alice.login("alice", "pw1", true).await;
    alice
        .send_kind(MessageType::MediaControl, r#"{"kind":"screen","state":"start"}"#)
        .await;
    alice.ping_barrier().await;

    let mut carol = TestClient::connect(hub.control).await;
    carol.login("carol", "pw3", true).await;
    let snapshot = carol.recv_kind(MessageType::MediaControl).await;
    assert_eq!(snapshot.sender.as_deref(), Some("alice"));
    let body: serde_json::Value = serde_json::from_slice(snapshot.payload_bytes()).unwrap();
    assert_eq!(body["kind"], "screen");
    assert_eq!(body["state"], "start");
}

#[tokio::test]
async fn duplicate_login_displaces_older_connection() {
    let hub = spawn_hub().await;
    let mut c1 = TestClient::connect(hub.control).await;
    c1.login("alice", "pw1", true).await;

    let mut c3 = TestClient::connect(hub.control).await;
    c3.login("alice", "pw1", false).await;

    // The newer connection is authoritative; the list holds a single alice.
    let list = c3.recv_kind(MessageType::UsersListResponse).await;
    assert_eq!(users_set(&list), ["alice"]);

    assert!(c1.closed().await, "displaced connection should be closed");
    assert_eq!(hub.state.registry.authenticated_usernames(), ["alice"]);
}

#[tokio::test]
async fn logout_echoes_bye_and_retracts_presence() {
    let hub = spawn_hub().await;
    let mut alice = TestClient::connect(hub.control).await;
    alice.login("alice", "pw1", true).await;
    let mut bob = TestClient::connect(hub.control).await;
    bob.login("bob", "pw2", true).await;

    alice.send_kind(MessageType::LogoutRequest, &b""[..]).await;
    let bye = alice.recv_kind(MessageType::LogoutRequest).await;
    assert_eq!(bye.payload_bytes(), b"bye");

    let list = bob.recv_kind(MessageType::UsersListResponse).await;
    assert_eq!(users_set(&list), ["bob"]);

    // The connection is back to the unauthenticated state.
    alice.send_kind(MessageType::ChatMessage, &b"hi"[..]).await;
    let err = alice.recv_kind(MessageType::Error).await;
    assert_eq!(err.payload_bytes(), b"Not authenticated");
}

#[tokio::test]
async fn screen_frames_fan_out_to_everyone_but_the_sender() {
    let hub = spawn_hub().await;
    let mut alice = TestClient::connect(hub.control).await;
    alice.login("alice", "pw1", true).await;
    let mut bob = TestClient::connect(hub.control).await;
    bob.login("bob", "pw2", true).await;

    let mut payload = 7u32.to_be_bytes().to_vec();
    payload.extend_from_slice(b"h264-bytes");
    alice.send_kind(MessageType::ScreenFrame, payload.clone()).await;

    let got = bob.recv_kind(MessageType::ScreenFrame).await;
    assert_eq!(got.sender.as_deref(), Some("alice"));
    assert_eq!(got.payload_bytes(), &payload[..]);

    // No echo to the sender: nothing screen-shaped arrives before the pong.
    alice.send_kind(MessageType::Ping, &b"x"[..]).await;
    loop {
        let msg = alice.recv().await;
        match msg.message_type() {
            Some(MessageType::Pong) => break,
            Some(MessageType::ScreenFrame) => panic!("sender received its own screen frame"),
            _ => {}
        }
    }
}
