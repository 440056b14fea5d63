//! Server side of the voice, screen-share and chat hub.
//!
//! A selective forwarding unit plus presence broker: the TCP dispatcher
//! authenticates sessions and relays chat and presence, the UDP forwarder
//! fans media datagrams out to every other participant, and the web bridge
//! re-exposes a user's live stream to browsers. Everything meets in the
//! [`registry::SessionRegistry`].

pub mod config;
pub mod dispatcher;
pub mod outbound;
pub mod registry;
pub mod sfu;
pub mod web;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};

use hub_store::{ChatHistory, CredentialStore, TelegramLinks};

use crate::config::Config;
use crate::registry::{PortKind, SessionRegistry};
use crate::web::WebBridge;

/// Shared state threaded into every listener and handler; nothing here is
/// process-global.
pub struct HubState {
    pub registry: SessionRegistry,
    pub users: Arc<CredentialStore>,
    pub links: Arc<TelegramLinks>,
    pub history: Arc<ChatHistory>,
    pub bridge: Arc<WebBridge>,
}

pub fn build_state(cfg: &Config) -> Arc<HubState> {
    Arc::new(HubState {
        registry: SessionRegistry::new(),
        users: Arc::new(CredentialStore::open(&cfg.users_file)),
        links: Arc::new(TelegramLinks::open(&cfg.links_file)),
        history: Arc::new(ChatHistory::open(&cfg.history_file)),
        bridge: Arc::new(WebBridge::new()),
    })
}

pub struct Hub {
    control: TcpListener,
    voice: UdpSocket,
    video: UdpSocket,
    http: TcpListener,
    state: Arc<HubState>,
}

impl Hub {
    /// Bind every listener up front. Any failure here is fatal; the caller
    /// exits non-zero.
    pub async fn bind(cfg: &Config, state: Arc<HubState>) -> Result<Self> {
        let control = TcpListener::bind(&cfg.control_listen)
            .await
            .with_context(|| format!("bind control port {}", cfg.control_listen))?;
        let voice = UdpSocket::bind((cfg.udp_bind.as_str(), cfg.voice_port))
            .await
            .with_context(|| format!("bind voice udp port {}", cfg.voice_port))?;
        let video = UdpSocket::bind((cfg.udp_bind.as_str(), cfg.video_port))
            .await
            .with_context(|| format!("bind video udp port {}", cfg.video_port))?;
        let http = TcpListener::bind(&cfg.http_listen)
            .await
            .with_context(|| format!("bind http port {}", cfg.http_listen))?;
        Ok(Self { control, voice, video, http, state })
    }

    pub fn state(&self) -> Arc<HubState> {
        self.state.clone()
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.control.local_addr()?)
    }

    pub fn voice_addr(&self) -> Result<SocketAddr> {
        Ok(self.voice.local_addr()?)
    }

    pub fn video_addr(&self) -> Result<SocketAddr> {
        Ok(self.video.local_addr()?)
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.http.local_addr()?)
    }

    /// Drive every loop; returns only when a listener fails.
    pub async fn serve(self) -> Result<()> {
        let Hub { control, voice, video, http, state } = self;
        tokio::try_join!(
            dispatcher::run_control_listener(control, state.clone()),
            sfu::run(voice, PortKind::Voice, state.clone()),
            sfu::run(video, PortKind::Video, state.clone()),
            web::run_http(http, state.bridge.clone()),
        )?;
        Ok(())
    }
}
