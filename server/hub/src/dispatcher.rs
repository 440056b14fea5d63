//! Framed TCP control dispatcher.
//!
//! One read loop per accepted connection feeds a [`FrameBuffer`] and hands
//! complete records to the handlers below. Everything a handler emits goes
//! through the per-connection outbound queue, so peers only ever observe
//! whole frames, in the order this side emitted them.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use hub_proto::frame::{self, Decoded, FrameBuffer};
use hub_proto::types::{Message, MessageType};

use crate::outbound;
use crate::registry::{ConnId, MediaState};
use crate::HubState;

const READ_CHUNK: usize = 16 * 1024;
/// StreamAudio payloads carry a 4-byte sequence and an 8-byte timestamp
/// ahead of the raw PCM the web bridge wants.
const STREAM_AUDIO_PREFIX: usize = 12;

pub async fn run_control_listener(listener: TcpListener, state: Arc<HubState>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "control listening");
    loop {
        let (stream, remote) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(stream, remote, state).await {
                debug!(%remote, "connection ended with error: {e:#}");
            }
        });
    }
}

async fn handle_conn(stream: TcpStream, remote: SocketAddr, state: Arc<HubState>) -> Result<()> {
    info!(%remote, "new connection");
    let (mut rd, wr) = stream.into_split();
    let (handle, queue) = outbound::channel();
    let (kill_tx, mut kill_rx) = watch::channel(false);
    let conn = state.registry.register(remote, handle, kill_tx);
    tokio::spawn(outbound::run_writer(queue, wr));

    let mut frames = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let result: Result<()> = 'conn: loop {
        tokio::select! {
            // Displacement or queue overflow; the writer still flushes.
            _ = kill_rx.changed() => break 'conn Ok(()),
            read = rd.read(&mut chunk) => {
                let n = match read {
                    Ok(0) => break 'conn Ok(()),
                    Ok(n) => n,
                    Err(e) => break 'conn Err(e.into()),
                };
                frames.extend(&chunk[..n]);
                loop {
                    match frames.next() {
                        Ok(Decoded::Frame(msg)) => handle_message(&state, conn, remote, msg),
                        Ok(Decoded::Malformed) => {
                            warn!(%remote, "frame decode failed");
                            send_error(&state, conn, "Malformed message");
                        }
                        Ok(Decoded::NeedMore) => break,
                        Err(e) => break 'conn Err(e.into()),
                    }
                }
            }
        }
    };

    match state.registry.remove_conn(conn) {
        Some(unbound) => {
            info!(%remote, user = %unbound.user, "disconnected");
            announce_media_stops(&state, &unbound.user, &unbound.stopped_kinds);
            broadcast_users_list(&state);
        }
        None => info!(%remote, "disconnected"),
    }
    result
}

fn handle_message(state: &HubState, conn: ConnId, remote: SocketAddr, msg: Message) {
    let Some(kind) = msg.message_type() else {
        send_error(state, conn, "Unsupported message type");
        return;
    };
    if !matches!(
        kind,
        MessageType::VoiceChunk
            | MessageType::ScreenFrame
            | MessageType::StreamAudio
            | MessageType::WebFrame
    ) {
        debug!(%remote, tag = msg.kind, "recv");
    }

    match kind {
        MessageType::LoginRequest => handle_login(state, conn, &msg),
        MessageType::LogoutRequest => handle_logout(state, conn),
        // Server-emitted kinds are never valid inbound, authenticated or not.
        MessageType::LoginResponse
        | MessageType::HistoryResponse
        | MessageType::UsersListResponse
        | MessageType::Pong
        | MessageType::Error => send_error(state, conn, "Unsupported message type"),
        _ => {
            let Some(user) = state.registry.user_of(conn) else {
                send_error(state, conn, "Not authenticated");
                return;
            };
            match kind {
                MessageType::ChatMessage => handle_chat(state, &user, &msg),
                MessageType::ChatMedia => handle_chat_media(state, &user, &msg),
                MessageType::HistoryRequest => handle_history(state, conn),
                MessageType::UsersListRequest => send_to(state, conn, users_list_frame(state)),
                MessageType::UdpPortsAnnouncement => {
                    handle_udp_ports(state, conn, remote, &user, &msg)
                }
                MessageType::VoiceChunk | MessageType::ScreenFrame => {
                    forward_media(state, conn, &user, msg)
                }
                MessageType::StreamAudio => handle_stream_audio(state, conn, &user, msg),
                MessageType::WebFrame => handle_web_frame(state, &user, msg),
                MessageType::MediaControl => handle_media_control(state, conn, &user, &msg),
                MessageType::Ping => handle_ping(state, conn, &msg),
                _ => send_error(state, conn, "Unsupported message type"),
            }
        }
    }
}

#[derive(Deserialize)]
struct LoginPayload {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    register: bool,
}

fn handle_login(state: &HubState, conn: ConnId, msg: &Message) {
    let payload: LoginPayload = match serde_json::from_slice(msg.payload_bytes()) {
        Ok(p) => p,
        Err(_) => {
            send_error(state, conn, "Invalid login payload");
            return;
        }
    };
    if payload.username.is_empty() || payload.password.is_empty() {
        send_error(state, conn, "Username/password required");
        return;
    }

    if payload.register {
        info!(user = %payload.username, "register attempt");
        if state.users.create_if_absent(&payload.username, &payload.password).is_err() {
            warn!(user = %payload.username, "register failed, user exists");
            send_error(state, conn, "User already exists");
            return;
        }
    } else {
        info!(user = %payload.username, "login attempt");
        if !state.users.verify(&payload.username, &payload.password) {
            warn!(user = %payload.username, "invalid credentials");
            send_error(state, conn, "Invalid credentials");
            return;
        }
    }

    if let Some(displaced) = state.registry.bind(conn, &payload.username) {
        info!(user = %payload.username, ?displaced, "displaced previous session");
    }

    let mut resp = Message::new(MessageType::LoginResponse);
    resp.sender = Some("server".into());
    resp.payload = Some(Bytes::from_static(b"ok"));
    resp.timestamp_ms = now_ms();
    send_to(state, conn, frame::encode(&resp));
    info!(user = %payload.username, "login success");

    broadcast_users_list(state);

    // Replay current media activity so the new client renders LIVE tags.
    for (kind, user) in state.registry.media_snapshot() {
        send_to(state, conn, media_control_frame(&kind, MediaState::Start, &user));
    }
}

fn handle_logout(state: &HubState, conn: ConnId) {
    let mut resp = Message::new(MessageType::LogoutRequest);
    resp.sender = Some("server".into());
    resp.payload = Some(Bytes::from_static(b"bye"));
    resp.timestamp_ms = now_ms();
    send_to(state, conn, frame::encode(&resp));

    if let Some(unbound) = state.registry.unbind(conn) {
        info!(user = %unbound.user, "logout");
        announce_media_stops(state, &unbound.user, &unbound.stopped_kinds);
        broadcast_users_list(state);
    }
}

fn handle_chat(state: &HubState, user: &str, msg: &Message) {
    let text = msg.text_payload();
    state.history.append(&format!("{user}: {text}"));
    info!(%user, "chat message");

    let mut outbound = msg.clone();
    outbound.sender = Some(user.to_string());
    outbound.timestamp_ms = now_ms();
    // The sender gets the canonical echo too.
    broadcast_control(state, frame::encode(&outbound), None);
}

fn handle_chat_media(state: &HubState, user: &str, msg: &Message) {
    let size = msg.payload_bytes().len();
    state.history.append(&format!("{user}: [media {size} bytes]"));

    let mut outbound = msg.clone();
    outbound.sender = Some(user.to_string());
    outbound.timestamp_ms = now_ms();
    broadcast_control(state, frame::encode(&outbound), None);
}

fn handle_history(state: &HubState, conn: ConnId) {
    let mut resp = Message::new(MessageType::HistoryResponse);
    resp.sender = Some("server".into());
    resp.payload = Some(state.history.snapshot().join("\n").into_bytes().into());
    resp.timestamp_ms = now_ms();
    send_to(state, conn, frame::encode(&resp));
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UdpPortsPayload {
    #[serde(default)]
    voice_port: u16,
    #[serde(default)]
    video_port: u16,
}

fn handle_udp_ports(
    state: &HubState,
    conn: ConnId,
    remote: SocketAddr,
    user: &str,
    msg: &Message,
) {
    let payload: UdpPortsPayload = match serde_json::from_slice(msg.payload_bytes()) {
        Ok(p) => p,
        Err(_) => {
            send_error(state, conn, "Invalid UDP announce payload");
            return;
        }
    };
    // The observed TCP source address is trusted; the ports come from the
    // payload because the client cannot see its own NAT mapping.
    state
        .registry
        .announce_udp(user, remote.ip(), payload.voice_port, payload.video_port);
    info!(
        %user,
        addr = %remote.ip(),
        voice = payload.voice_port,
        video = payload.video_port,
        "udp announce"
    );
}

fn forward_media(state: &HubState, origin: ConnId, user: &str, mut msg: Message) {
    msg.sender = Some(user.to_string());
    msg.timestamp_ms = now_ms();
    broadcast_media(state, frame::encode(&msg), origin);
}

fn handle_stream_audio(state: &HubState, origin: ConnId, user: &str, msg: Message) {
    if let Some(payload) = &msg.payload {
        if payload.len() > STREAM_AUDIO_PREFIX {
            state.bridge.push_audio(user, payload.slice(STREAM_AUDIO_PREFIX..));
        }
    }
    forward_media(state, origin, user, msg);
}

fn handle_web_frame(state: &HubState, user: &str, msg: Message) {
    if let Some(jpeg) = msg.payload {
        if !jpeg.is_empty() {
            state.bridge.push_frame(user, jpeg);
        }
    }
}

#[derive(Deserialize)]
struct MediaControlPayload {
    kind: String,
    state: String,
}

fn handle_media_control(state: &HubState, origin: ConnId, user: &str, msg: &Message) {
    let payload: MediaControlPayload = match serde_json::from_slice(msg.payload_bytes()) {
        Ok(p) => p,
        Err(_) => {
            send_error(state, origin, "Invalid media control payload");
            return;
        }
    };
    let media_state = match payload.state.as_str() {
        "start" => MediaState::Start,
        "stop" => MediaState::Stop,
        _ => {
            send_error(state, origin, "Invalid media control payload");
            return;
        }
    };
    state.registry.set_media(&payload.kind, user, media_state);
    info!(%user, kind = %payload.kind, state = %payload.state, "media control");
    broadcast_control(
        state,
        media_control_frame(&payload.kind, media_state, user),
        Some(origin),
    );
}

fn handle_ping(state: &HubState, conn: ConnId, msg: &Message) {
    let mut resp = Message::new(MessageType::Pong);
    resp.sender = Some("server".into());
    resp.payload = msg.payload.clone();
    resp.timestamp_ms = now_ms();
    send_to(state, conn, frame::encode(&resp));
}

fn announce_media_stops(state: &HubState, user: &str, kinds: &[String]) {
    for kind in kinds {
        broadcast_control(state, media_control_frame(kind, MediaState::Stop, user), None);
    }
}

fn media_control_frame(kind: &str, state: MediaState, from: &str) -> Bytes {
    let state_str = match state {
        MediaState::Start => "start",
        MediaState::Stop => "stop",
    };
    let mut msg = Message::new(MessageType::MediaControl);
    msg.sender = Some(from.to_string());
    msg.payload = Some(
        serde_json::json!({ "kind": kind, "state": state_str })
            .to_string()
            .into(),
    );
    msg.timestamp_ms = now_ms();
    frame::encode(&msg)
}

fn users_list_frame(state: &HubState) -> Bytes {
    let mut resp = Message::new(MessageType::UsersListResponse);
    resp.sender = Some("server".into());
    resp.payload = Some(
        state
            .registry
            .authenticated_usernames()
            .join("\n")
            .into_bytes()
            .into(),
    );
    resp.timestamp_ms = now_ms();
    frame::encode(&resp)
}

fn broadcast_users_list(state: &HubState) {
    broadcast_control(state, users_list_frame(state), None);
}

fn send_to(state: &HubState, conn: ConnId, frame: Bytes) {
    if let Some(handle) = state.registry.handle_of(conn) {
        if !handle.send_control(frame) {
            warn!(?conn, "outbound queue overflow, closing");
            state.registry.kill(conn);
        }
    }
}

fn broadcast_control(state: &HubState, frame: Bytes, except: Option<ConnId>) {
    for (id, _user, handle) in state.registry.authenticated_handles() {
        if Some(id) == except {
            continue;
        }
        if !handle.send_control(frame.clone()) {
            warn!(?id, "outbound queue overflow, closing");
            state.registry.kill(id);
        }
    }
}

fn broadcast_media(state: &HubState, frame: Bytes, origin: ConnId) {
    for (id, _user, handle) in state.registry.authenticated_handles() {
        if id == origin {
            continue;
        }
        handle.send_media(frame.clone());
    }
}

fn send_error(state: &HubState, conn: ConnId, reason: &str) {
    warn!(%reason, "error reply");
    let mut resp = Message::new(MessageType::Error);
    resp.sender = Some("server".into());
    resp.payload = Some(Bytes::copy_from_slice(reason.as_bytes()));
    resp.timestamp_ms = now_ms();
    send_to(state, conn, frame::encode(&resp));
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
