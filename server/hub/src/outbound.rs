//! Per-connection outbound queue.
//!
//! One writer task owns the socket write half; everything else enqueues
//! complete encoded frames through [`OutboundHandle`]. The queue isolates
//! slow receivers from the broadcaster: media frames are shed once a
//! receiver falls behind, control frames are never shed but a queue past
//! its hard bound closes the connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;

/// Media-class frames are shed beyond this much queued data.
pub const MEDIA_DROP_BYTES: usize = 256 * 1024;
/// Control-class frames past this bound close the connection.
pub const QUEUE_KILL_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct OutboundHandle {
    tx: mpsc::UnboundedSender<Bytes>,
    queued: Arc<AtomicUsize>,
}

impl OutboundHandle {
    /// Enqueue a control-class record (login, chat, presence, history).
    /// Returns `false` when the queue bound was exceeded; the caller must
    /// close the connection.
    pub fn send_control(&self, frame: Bytes) -> bool {
        let queued = self.queued.fetch_add(frame.len(), Ordering::Relaxed) + frame.len();
        if self.tx.send(frame).is_err() {
            // Writer already gone; the connection is tearing down.
            return true;
        }
        queued <= QUEUE_KILL_BYTES
    }

    /// Enqueue a media-class record (voice, screen, stream audio), shedding
    /// it when the receiver is congested.
    pub fn send_media(&self, frame: Bytes) {
        if self.queued.load(Ordering::Relaxed) >= MEDIA_DROP_BYTES {
            counter!("hub_tcp_media_dropped_total").increment(1);
            return;
        }
        self.queued.fetch_add(frame.len(), Ordering::Relaxed);
        let _ = self.tx.send(frame);
    }
}

pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<Bytes>,
    queued: Arc<AtomicUsize>,
}

pub fn channel() -> (OutboundHandle, OutboundQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));
    (OutboundHandle { tx, queued: queued.clone() }, OutboundQueue { rx, queued })
}

/// Drain queued frames to the socket. Frames are written whole, so peers
/// never observe a partial record. Exits once every handle is dropped
/// (flushing whatever is still queued) or on the first write error.
pub async fn run_writer(mut queue: OutboundQueue, mut wr: OwnedWriteHalf) {
    while let Some(frame) = queue.rx.recv().await {
        let len = frame.len();
        if wr.write_all(&frame).await.is_err() {
            break;
        }
        queue.queued.fetch_sub(len, Ordering::Relaxed);
    }
    let _ = wr.shutdown().await;
}
