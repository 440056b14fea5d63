//! Dual-port UDP selective forwarding unit.
//!
//! Each port runs one receive loop: resolve the source endpoint to a user,
//! validate the media header, stamp the authoritative ssrc, fan the datagram
//! out to every other user's announced endpoint on the same port. No jitter
//! buffering, no reordering, no retransmission; per-datagram state is the
//! endpoint index only.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use metrics::counter;
use tokio::net::UdpSocket;
use tracing::{info, warn};

use hub_proto::media::{self, MediaHeader};
use hub_proto::ssrc_of;

use crate::registry::PortKind;
use crate::HubState;

const RECV_BUF: usize = 2048;
const MALFORMED_LOG_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run(socket: UdpSocket, port: PortKind, state: Arc<HubState>) -> Result<()> {
    let label = match port {
        PortKind::Voice => "voice",
        PortKind::Video => "video",
    };
    info!(addr = %socket.local_addr()?, port = label, "sfu listening");

    let mut buf = vec![0u8; RECV_BUF];
    let mut malformed_log = RateLimited::new(MALFORMED_LOG_INTERVAL);
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        counter!("hub_sfu_rx_packets_total", "port" => label).increment(1);

        // Unknown source endpoint: not an announced, authenticated user.
        let Some(sender) = state.registry.user_by_endpoint(port, from.ip(), from.port()) else {
            counter!("hub_sfu_drops_total", "reason" => "unknown_endpoint").increment(1);
            continue;
        };
        let Some(header) = MediaHeader::parse(&buf[..len]) else {
            counter!("hub_sfu_drops_total", "reason" => "malformed").increment(1);
            if malformed_log.allow() {
                warn!(user = %sender, %from, port = label, "dropping malformed media datagram");
            }
            continue;
        };

        // The server is authoritative for stream attribution, whatever the
        // client wrote. Trailing bytes past the declared payload are never
        // forwarded.
        let wire_len = header.wire_len();
        media::patch_ssrc(&mut buf[..wire_len], ssrc_of(&sender));

        let targets = state.registry.fanout_endpoints(port, &sender);
        for target in &targets {
            let _ = socket.send_to(&buf[..wire_len], target).await;
        }
        counter!("hub_sfu_tx_packets_total", "port" => label).increment(targets.len() as u64);
    }
}

/// At most one log line per interval; misbehaving peers stay visible
/// without flooding the log at packet rate.
struct RateLimited {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimited {
    fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RateLimited;
    use std::time::Duration;

    #[test]
    fn rate_limiter_allows_first_and_suppresses_burst() {
        let mut rl = RateLimited::new(Duration::from_secs(60));
        assert!(rl.allow());
        assert!(!rl.allow());
        assert!(!rl.allow());
    }
}
