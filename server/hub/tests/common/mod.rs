//! Shared harness: a hub on ephemeral ports plus a minimal wire client.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use hub_proto::frame::{self, Decoded, FrameBuffer};
use hub_proto::types::{Message, MessageType};
use hub_server::config::Config;
use hub_server::{build_state, Hub, HubState};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestHub {
    pub control: SocketAddr,
    pub voice: SocketAddr,
    pub video: SocketAddr,
    pub http: SocketAddr,
    pub state: Arc<HubState>,
    _dir: TempDir,
}

pub async fn spawn_hub() -> TestHub {
    let dir = TempDir::new().unwrap();
    let cfg = Config {
        control_listen: "127.0.0.1:0".into(),
        udp_bind: "127.0.0.1".into(),
        voice_port: 0,
        video_port: 0,
        http_listen: "127.0.0.1:0".into(),
        users_file: dir.path().join("users.json").to_string_lossy().into_owned(),
        links_file: dir.path().join("telegram_links.json").to_string_lossy().into_owned(),
        history_file: dir.path().join("history.log").to_string_lossy().into_owned(),
        tg_bot_token: None,
    };
    let state = build_state(&cfg);
    let hub = Hub::bind(&cfg, state.clone()).await.unwrap();
    let handles = TestHub {
        control: hub.control_addr().unwrap(),
        voice: hub.voice_addr().unwrap(),
        video: hub.video_addr().unwrap(),
        http: hub.http_addr().unwrap(),
        state,
        _dir: dir,
    };
    tokio::spawn(hub.serve());
    handles
}

pub struct TestClient {
    stream: TcpStream,
    frames: FrameBuffer,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            frames: FrameBuffer::new(),
        }
    }

    pub async fn send(&mut self, msg: &Message) {
        self.stream.write_all(&frame::encode(msg)).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn send_kind(&mut self, kind: MessageType, payload: impl Into<Bytes>) {
        let mut msg = Message::new(kind);
        msg.payload = Some(payload.into());
        self.send(&msg).await;
    }

    pub async fn recv(&mut self) -> Message {
        timeout(RECV_TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for a frame")
    }

    async fn recv_inner(&mut self) -> Message {
        let mut chunk = [0u8; 4096];
        loop {
            match self.frames.next().unwrap() {
                Decoded::Frame(msg) => return msg,
                Decoded::Malformed => panic!("server sent a malformed frame"),
                Decoded::NeedMore => {}
            }
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "server closed the connection");
            self.frames.extend(&chunk[..n]);
        }
    }

    /// Skip records until one of the wanted kind arrives.
    pub async fn recv_kind(&mut self, kind: MessageType) -> Message {
        loop {
            let msg = self.recv().await;
            if msg.message_type() == Some(kind) {
                return msg;
            }
        }
    }

    pub async fn login(&mut self, user: &str, password: &str, register: bool) {
        self.send_kind(
            MessageType::LoginRequest,
            format!(r#"{{"username":"{user}","password":"{password}","register":{register}}}"#),
        )
        .await;
        let resp = self.recv().await;
        assert_eq!(resp.message_type(), Some(MessageType::LoginResponse));
        assert_eq!(resp.payload_bytes(), b"ok");
    }

    /// Processed-barrier: records are handled in arrival order per
    /// connection, so a Pong proves everything sent before the Ping landed.
    pub async fn ping_barrier(&mut self) {
        self.send_kind(MessageType::Ping, &b"barrier"[..]).await;
        self.recv_kind(MessageType::Pong).await;
    }

    /// True once the server has closed this connection.
    pub async fn closed(mut self) -> bool {
        let mut chunk = [0u8; 4096];
        loop {
            match timeout(RECV_TIMEOUT, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }
}

/// Sorted usernames out of a UsersListResponse payload.
pub fn users_set(msg: &Message) -> Vec<String> {
    let text = msg.text_payload();
    let mut users: Vec<String> = text
        .split('\n')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    users.sort();
    users
}
