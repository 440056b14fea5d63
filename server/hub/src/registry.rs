//! Process-wide session index: TCP connection <-> authenticated user <->
//! learned UDP endpoints <-> active media state.
//!
//! One mutex guards all of it, so the forward and reverse indices are
//! consistent at every observation point outside a single mutation. All
//! dispatcher and forwarder code goes through these primitives; nothing
//! else touches the maps.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::outbound::OutboundHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

/// Which of the two fixed UDP ports a datagram or endpoint belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortKind {
    Voice,
    Video,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaState {
    Start,
    Stop,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpEndpoints {
    pub address: IpAddr,
    pub voice_port: u16,
    pub video_port: u16,
}

/// What a connection gave up when it left the authenticated state.
pub struct Unbound {
    pub user: String,
    /// Media kinds the user was actively producing, sorted.
    pub stopped_kinds: Vec<String>,
}

struct ConnEntry {
    addr: SocketAddr,
    user: Option<String>,
    outbound: OutboundHandle,
    kill: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    next_conn: u64,
    conns: HashMap<ConnId, ConnEntry>,
    user_conn: HashMap<String, ConnId>,
    udp_by_user: HashMap<String, UdpEndpoints>,
    voice_by_endpoint: HashMap<(IpAddr, u16), String>,
    video_by_endpoint: HashMap<(IpAddr, u16), String>,
    /// kind -> users currently producing that kind.
    active_media: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        addr: SocketAddr,
        outbound: OutboundHandle,
        kill: watch::Sender<bool>,
    ) -> ConnId {
        let mut inner = self.inner.lock();
        inner.next_conn += 1;
        let id = ConnId(inner.next_conn);
        inner.conns.insert(id, ConnEntry { addr, user: None, outbound, kill });
        id
    }

    /// Associate a connection with a username. A different connection
    /// already holding the name is displaced: its binding and endpoint
    /// mappings are retracted here and its read loop is signalled to stop,
    /// after which its writer flushes and closes. The user's active-media
    /// state survives displacement; the user never left.
    pub fn bind(&self, conn: ConnId, user: &str) -> Option<ConnId> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.conns.contains_key(&conn) {
            return None;
        }

        // Re-login under a different name on the same connection.
        let prev = inner.conns.get_mut(&conn).and_then(|e| e.user.take());
        if let Some(prev) = prev.filter(|p| p != user) {
            if inner.user_conn.get(&prev) == Some(&conn) {
                inner.user_conn.remove(&prev);
            }
            inner.retract_endpoints(&prev);
        }

        let displaced = match inner.user_conn.get(user) {
            Some(&other) if other != conn => Some(other),
            _ => None,
        };
        if let Some(other) = displaced {
            if let Some(entry) = inner.conns.get_mut(&other) {
                entry.user = None;
                entry.kill.send_replace(true);
            }
            inner.retract_endpoints(user);
        }

        if let Some(entry) = inner.conns.get_mut(&conn) {
            entry.user = Some(user.to_string());
        }
        inner.user_conn.insert(user.to_string(), conn);
        displaced
    }

    /// Clear a connection's user binding and everything hanging off it.
    /// The connection itself stays registered (logout without disconnect).
    pub fn unbind(&self, conn: ConnId) -> Option<Unbound> {
        unbind_locked(&mut self.inner.lock(), conn)
    }

    /// Full teardown on disconnect: unbind, then forget the connection.
    pub fn remove_conn(&self, conn: ConnId) -> Option<Unbound> {
        let mut inner = self.inner.lock();
        let unbound = unbind_locked(&mut inner, conn);
        inner.conns.remove(&conn);
        unbound
    }

    /// Signal a connection's read loop to stop. Queued frames still flush.
    pub fn kill(&self, conn: ConnId) {
        if let Some(entry) = self.inner.lock().conns.get(&conn) {
            entry.kill.send_replace(true);
        }
    }

    pub fn user_of(&self, conn: ConnId) -> Option<String> {
        self.inner.lock().conns.get(&conn).and_then(|e| e.user.clone())
    }

    pub fn conn_of(&self, user: &str) -> Option<ConnId> {
        self.inner.lock().user_conn.get(user).copied()
    }

    pub fn peer_addr(&self, conn: ConnId) -> Option<SocketAddr> {
        self.inner.lock().conns.get(&conn).map(|e| e.addr)
    }

    pub fn handle_of(&self, conn: ConnId) -> Option<OutboundHandle> {
        self.inner.lock().conns.get(&conn).map(|e| e.outbound.clone())
    }

    /// Snapshot of every authenticated connection, for fan-out.
    pub fn authenticated_handles(&self) -> Vec<(ConnId, String, OutboundHandle)> {
        let inner = self.inner.lock();
        inner
            .conns
            .iter()
            .filter_map(|(&id, e)| e.user.clone().map(|u| (id, u, e.outbound.clone())))
            .collect()
    }

    /// Deduplicated, sorted usernames of authenticated connections.
    pub fn authenticated_usernames(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut users: Vec<String> = inner.user_conn.keys().cloned().collect();
        users.sort();
        users
    }

    /// Replace the user's UDP endpoints with newly announced ones, keeping
    /// the reverse indices exact: stale `addr:port -> user` entries would
    /// misattribute stray datagrams.
    pub fn announce_udp(&self, user: &str, address: IpAddr, voice_port: u16, video_port: u16) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.retract_endpoints(user);
        let ep = UdpEndpoints { address, voice_port, video_port };
        if voice_port != 0 {
            inner.voice_by_endpoint.insert((address, voice_port), user.to_string());
        }
        if video_port != 0 {
            inner.video_by_endpoint.insert((address, video_port), user.to_string());
        }
        inner.udp_by_user.insert(user.to_string(), ep);
    }

    pub fn user_by_endpoint(&self, kind: PortKind, address: IpAddr, port: u16) -> Option<String> {
        let inner = self.inner.lock();
        let map = match kind {
            PortKind::Voice => &inner.voice_by_endpoint,
            PortKind::Video => &inner.video_by_endpoint,
        };
        map.get(&(address, port)).cloned()
    }

    pub fn endpoints_of(&self, user: &str) -> Option<UdpEndpoints> {
        self.inner.lock().udp_by_user.get(user).cloned()
    }

    /// Destinations for one forwarded datagram: every other user with a
    /// known, non-zero endpoint on this port.
    pub fn fanout_endpoints(&self, kind: PortKind, exclude_user: &str) -> Vec<SocketAddr> {
        let inner = self.inner.lock();
        inner
            .udp_by_user
            .iter()
            .filter(|(user, _)| user.as_str() != exclude_user)
            .filter_map(|(_, ep)| {
                let port = match kind {
                    PortKind::Voice => ep.voice_port,
                    PortKind::Video => ep.video_port,
                };
                (port != 0).then(|| SocketAddr::new(ep.address, port))
            })
            .collect()
    }

    pub fn set_media(&self, kind: &str, user: &str, state: MediaState) {
        let mut inner = self.inner.lock();
        match state {
            MediaState::Start => {
                inner
                    .active_media
                    .entry(kind.to_string())
                    .or_default()
                    .insert(user.to_string());
            }
            MediaState::Stop => {
                if let Some(users) = inner.active_media.get_mut(kind) {
                    users.remove(user);
                    if users.is_empty() {
                        inner.active_media.remove(kind);
                    }
                }
            }
        }
    }

    /// Every `(kind, user)` pair currently in the start state, sorted.
    pub fn media_snapshot(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock();
        let mut pairs: Vec<(String, String)> = inner
            .active_media
            .iter()
            .flat_map(|(kind, users)| users.iter().map(|u| (kind.clone(), u.clone())))
            .collect();
        pairs.sort();
        pairs
    }
}

impl Inner {
    fn retract_endpoints(&mut self, user: &str) {
        let Some(ep) = self.udp_by_user.remove(user) else { return };
        // Only remove reverse entries this user still owns; another user may
        // have re-announced the same endpoint meanwhile.
        if ep.voice_port != 0
            && self.voice_by_endpoint.get(&(ep.address, ep.voice_port)).map(String::as_str)
                == Some(user)
        {
            self.voice_by_endpoint.remove(&(ep.address, ep.voice_port));
        }
        if ep.video_port != 0
            && self.video_by_endpoint.get(&(ep.address, ep.video_port)).map(String::as_str)
                == Some(user)
        {
            self.video_by_endpoint.remove(&(ep.address, ep.video_port));
        }
    }
}

fn unbind_locked(inner: &mut Inner, conn: ConnId) -> Option<Unbound> {
    let user = inner.conns.get_mut(&conn)?.user.take()?;
    if inner.user_conn.get(&user) == Some(&conn) {
        inner.user_conn.remove(&user);
    }
    inner.retract_endpoints(&user);
    let mut stopped = Vec::new();
    inner.active_media.retain(|kind, users| {
        if users.remove(&user) {
            stopped.push(kind.clone());
        }
        !users.is_empty()
    });
    stopped.sort();
    Some(Unbound { user, stopped_kinds: stopped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound;

    fn registry_with_conn(reg: &SessionRegistry) -> ConnId {
        let (handle, _queue) = outbound::channel();
        let (kill, _watch) = watch::channel(false);
        reg.register("127.0.0.1:5000".parse().unwrap(), handle, kill)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn bind_and_unbind_round_trip() {
        let reg = SessionRegistry::new();
        let c1 = registry_with_conn(&reg);
        assert_eq!(reg.bind(c1, "alice"), None);
        assert_eq!(reg.user_of(c1).as_deref(), Some("alice"));
        assert_eq!(reg.conn_of("alice"), Some(c1));
        assert_eq!(reg.authenticated_usernames(), ["alice"]);

        let unbound = reg.unbind(c1).expect("was bound");
        assert_eq!(unbound.user, "alice");
        assert_eq!(reg.user_of(c1), None);
        assert_eq!(reg.conn_of("alice"), None);
        assert!(reg.authenticated_usernames().is_empty());
    }

    #[test]
    fn later_login_displaces_earlier_connection() {
        let reg = SessionRegistry::new();
        let c1 = registry_with_conn(&reg);
        let c2 = registry_with_conn(&reg);
        reg.bind(c1, "alice");
        reg.announce_udp("alice", ip("10.0.0.1"), 5001, 5002);

        assert_eq!(reg.bind(c2, "alice"), Some(c1));
        assert_eq!(reg.user_of(c1), None);
        assert_eq!(reg.conn_of("alice"), Some(c2));
        // No duplicate in the users list, endpoints retracted.
        assert_eq!(reg.authenticated_usernames(), ["alice"]);
        assert_eq!(reg.user_by_endpoint(PortKind::Voice, ip("10.0.0.1"), 5001), None);
        assert_eq!(reg.endpoints_of("alice"), None);
        // The displaced connection's teardown finds nothing left to undo.
        assert!(reg.remove_conn(c1).is_none());
    }

    #[test]
    fn displacement_keeps_active_media() {
        let reg = SessionRegistry::new();
        let c1 = registry_with_conn(&reg);
        let c2 = registry_with_conn(&reg);
        reg.bind(c1, "alice");
        reg.set_media("screen", "alice", MediaState::Start);

        reg.bind(c2, "alice");
        assert_eq!(reg.media_snapshot(), [("screen".to_string(), "alice".to_string())]);
    }

    #[test]
    fn reannounce_replaces_reverse_indices_atomically() {
        let reg = SessionRegistry::new();
        let c1 = registry_with_conn(&reg);
        reg.bind(c1, "alice");

        reg.announce_udp("alice", ip("10.0.0.1"), 5001, 5002);
        reg.announce_udp("alice", ip("10.0.0.1"), 6001, 6002);

        // Old entries must be gone or a stray datagram gets misattributed.
        assert_eq!(reg.user_by_endpoint(PortKind::Voice, ip("10.0.0.1"), 5001), None);
        assert_eq!(reg.user_by_endpoint(PortKind::Video, ip("10.0.0.1"), 5002), None);
        assert_eq!(
            reg.user_by_endpoint(PortKind::Voice, ip("10.0.0.1"), 6001).as_deref(),
            Some("alice")
        );
        assert_eq!(
            reg.user_by_endpoint(PortKind::Video, ip("10.0.0.1"), 6002).as_deref(),
            Some("alice")
        );
    }

    #[test]
    fn retraction_spares_an_endpoint_reclaimed_by_another_user() {
        let reg = SessionRegistry::new();
        let c1 = registry_with_conn(&reg);
        let c2 = registry_with_conn(&reg);
        reg.bind(c1, "alice");
        reg.bind(c2, "bob");

        // Same NAT: bob re-announces the endpoint alice used to hold.
        reg.announce_udp("alice", ip("10.0.0.1"), 5001, 0);
        reg.announce_udp("bob", ip("10.0.0.1"), 5001, 0);
        reg.unbind(c1);

        assert_eq!(
            reg.user_by_endpoint(PortKind::Voice, ip("10.0.0.1"), 5001).as_deref(),
            Some("bob")
        );
    }

    #[test]
    fn fanout_skips_sender_and_zero_ports() {
        let reg = SessionRegistry::new();
        let c1 = registry_with_conn(&reg);
        let c2 = registry_with_conn(&reg);
        let c3 = registry_with_conn(&reg);
        reg.bind(c1, "alice");
        reg.bind(c2, "bob");
        reg.bind(c3, "carol");
        reg.announce_udp("alice", ip("10.0.0.1"), 5001, 5002);
        reg.announce_udp("bob", ip("10.0.0.2"), 6001, 6002);
        reg.announce_udp("carol", ip("10.0.0.3"), 0, 7002);

        let mut voice = reg.fanout_endpoints(PortKind::Voice, "alice");
        voice.sort();
        let expected_voice: Vec<SocketAddr> = vec!["10.0.0.2:6001".parse().unwrap()];
        assert_eq!(voice, expected_voice);

        let mut video = reg.fanout_endpoints(PortKind::Video, "alice");
        video.sort();
        let expected_video: Vec<SocketAddr> =
            vec!["10.0.0.2:6002".parse().unwrap(), "10.0.0.3:7002".parse().unwrap()];
        assert_eq!(video, expected_video);
    }

    #[test]
    fn unbind_reports_active_media_kinds() {
        let reg = SessionRegistry::new();
        let c1 = registry_with_conn(&reg);
        reg.bind(c1, "alice");
        reg.set_media("screen", "alice", MediaState::Start);
        reg.set_media("voice", "alice", MediaState::Start);
        reg.set_media("voice", "alice", MediaState::Stop);
        reg.set_media("screen", "alice", MediaState::Start);

        let unbound = reg.remove_conn(c1).expect("was bound");
        assert_eq!(unbound.stopped_kinds, ["screen"]);
        assert!(reg.media_snapshot().is_empty());
    }
}
