//! Browser-facing web viewer bridge.
//!
//! The dispatcher pushes each user's latest JPEG (WebFrame records) and raw
//! PCM (StreamAudio records) in here; attached HTTP viewers consume them as
//! a `multipart/x-mixed-replace` MJPEG stream and a chunked, endless WAV.
//! Pushes never block the TCP or UDP core: every viewer sits behind a small
//! bounded queue. A viewer leaves the multimap the moment its connection
//! drops (the response body deregisters itself on teardown); a viewer whose
//! queue fills up is evicted on push.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

pub const BOUNDARY: &str = "frame";
/// Frames a viewer may fall behind before it is considered stuck.
const VIEWER_QUEUE: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamKind {
    Mjpeg,
    Audio,
}

struct Viewer {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

#[derive(Default)]
pub struct WebBridge {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_viewer: u64,
    last_jpeg: HashMap<String, Bytes>,
    mjpeg: HashMap<String, Vec<Viewer>>,
    audio: HashMap<String, Vec<Viewer>>,
}

impl WebBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the user's newest JPEG and fan it out to attached viewers.
    pub fn push_frame(&self, user: &str, jpeg: Bytes) {
        let part = multipart_part(&jpeg);
        let mut inner = self.inner.lock();
        inner.last_jpeg.insert(user.to_string(), jpeg);
        deliver(&mut inner.mjpeg, user, part);
    }

    /// Fan one PCM payload out to attached audio viewers.
    pub fn push_audio(&self, user: &str, pcm: Bytes) {
        let mut inner = self.inner.lock();
        deliver(&mut inner.audio, user, pcm);
    }

    fn attach_mjpeg(self: Arc<Self>, user: &str) -> ViewerBody {
        let (tx, rx) = mpsc::channel(VIEWER_QUEUE);
        let id = {
            let mut inner = self.inner.lock();
            // New viewers see the last-known frame immediately.
            if let Some(jpeg) = inner.last_jpeg.get(user) {
                let _ = tx.try_send(multipart_part(jpeg));
            }
            inner.next_viewer += 1;
            let id = inner.next_viewer;
            inner.mjpeg.entry(user.to_string()).or_default().push(Viewer { id, tx });
            id
        };
        ViewerBody { rx, kind: StreamKind::Mjpeg, user: user.to_string(), id, bridge: self }
    }

    fn attach_audio(self: Arc<Self>, user: &str) -> ViewerBody {
        let (tx, rx) = mpsc::channel(VIEWER_QUEUE);
        let _ = tx.try_send(wav_header());
        let id = {
            let mut inner = self.inner.lock();
            inner.next_viewer += 1;
            let id = inner.next_viewer;
            inner.audio.entry(user.to_string()).or_default().push(Viewer { id, tx });
            id
        };
        ViewerBody { rx, kind: StreamKind::Audio, user: user.to_string(), id, bridge: self }
    }

    /// Remove one viewer from the multimap. Idempotent: the push path may
    /// already have evicted it.
    fn detach(&self, kind: StreamKind, user: &str, id: u64) {
        let mut inner = self.inner.lock();
        let map = match kind {
            StreamKind::Mjpeg => &mut inner.mjpeg,
            StreamKind::Audio => &mut inner.audio,
        };
        if let Some(list) = map.get_mut(user) {
            list.retain(|v| v.id != id);
            if list.is_empty() {
                map.remove(user);
            }
        }
    }
}

/// Best-effort delivery: a viewer whose queue is full or whose connection
/// is gone gets dropped from the multimap, which ends its response stream.
fn deliver(viewers: &mut HashMap<String, Vec<Viewer>>, user: &str, chunk: Bytes) {
    let Some(list) = viewers.get_mut(user) else { return };
    list.retain(|v| v.tx.try_send(chunk.clone()).is_ok());
    if list.is_empty() {
        viewers.remove(user);
    }
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut part = BytesMut::with_capacity(jpeg.len() + 96);
    part.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        )
        .as_bytes(),
    );
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

/// RIFF/WAVE header for an unbounded 48 kHz / 16-bit / stereo stream;
/// `0xFFFFFFFF` in the size fields marks it endless.
fn wav_header() -> Bytes {
    let mut h = BytesMut::with_capacity(44);
    h.extend_from_slice(b"RIFF");
    h.put_u32_le(0xFFFF_FFFF);
    h.extend_from_slice(b"WAVE");
    h.extend_from_slice(b"fmt ");
    h.put_u32_le(16);
    h.put_u16_le(1); // PCM
    h.put_u16_le(2); // stereo
    h.put_u32_le(48_000);
    h.put_u32_le(48_000 * 4); // byte rate
    h.put_u16_le(4); // block align
    h.put_u16_le(16); // bits per sample
    h.extend_from_slice(b"data");
    h.put_u32_le(0xFFFF_FFFF);
    h.freeze()
}

/// Streaming response body fed by the bridge. hyper drops it when the
/// viewer's connection ends, and the drop deregisters the viewer, so dead
/// sockets never linger in the multimap waiting for a producer push.
struct ViewerBody {
    rx: mpsc::Receiver<Bytes>,
    kind: StreamKind,
    user: String,
    id: u64,
    bridge: Arc<WebBridge>,
}

impl http_body::Body for ViewerBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Bytes>, Infallible>>> {
        match self.get_mut().rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(http_body::Frame::data(chunk)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ViewerBody {
    fn drop(&mut self) {
        self.bridge.detach(self.kind, &self.user, self.id);
    }
}

type BridgeBody = BoxBody<Bytes, Infallible>;

pub async fn run_http(listener: TcpListener, bridge: Arc<WebBridge>) -> Result<()> {
    info!(addr = %listener.local_addr()?, "web bridge listening");
    loop {
        let (stream, _) = listener.accept().await?;
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                let bridge = bridge.clone();
                async move { Ok::<_, Infallible>(route(req, bridge)) }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await;
        });
    }
}

fn route(req: Request<Incoming>, bridge: Arc<WebBridge>) -> Response<BridgeBody> {
    if req.method() != Method::GET {
        return text_response(400, "bad request");
    }
    let path = req.uri().path();

    if let Some(user) = path.strip_prefix("/mjpeg/") {
        if user.is_empty() {
            return text_response(400, "missing user");
        }
        let body = bridge.attach_mjpeg(user);
        return Response::builder()
            .status(200)
            .header(
                "content-type",
                format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
            )
            .body(body.boxed())
            .unwrap();
    }

    if let Some(user) = path.strip_prefix("/audio/") {
        if user.is_empty() {
            return text_response(400, "missing user");
        }
        let body = bridge.attach_audio(user);
        return Response::builder()
            .status(200)
            .header("content-type", "audio/wav")
            .header("connection", "close")
            .body(body.boxed())
            .unwrap();
    }

    // Everything else gets the viewer page.
    Response::builder()
        .status(200)
        .header("content-type", "text/html; charset=utf-8")
        .header("connection", "close")
        .body(Full::new(Bytes::from_static(VIEWER_PAGE.as_bytes())).boxed())
        .unwrap()
}

fn text_response(status: u16, body: &'static str) -> Response<BridgeBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .header("connection", "close")
        .body(Full::new(Bytes::from_static(body.as_bytes())).boxed())
        .unwrap()
}

const VIEWER_PAGE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>hub viewer</title></head>
<body>
<p>
  <input id="user" placeholder="username">
  <button onclick="watch()">watch</button>
</p>
<img id="screen" alt="">
<audio id="sound" controls autoplay></audio>
<script>
function watch() {
  const u = encodeURIComponent(document.getElementById('user').value);
  document.getElementById('screen').src = '/mjpeg/' + u;
  document.getElementById('sound').src = '/audio/' + u;
}
</script>
</body>
</html>
"#;
