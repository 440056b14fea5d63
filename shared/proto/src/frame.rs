//! Length-prefixed control records on the TCP channel.
//!
//! Layout (everything big-endian):
//!   u32 frame length L (bytes that follow)
//!   u8  type tag
//!   sender:    u32 byte length (0xFFFFFFFF = null) + UTF-16BE code units
//!   recipient: same encoding
//!   payload:   u32 byte length (0xFFFFFFFF = null) + raw bytes
//!   i64 timestamp, milliseconds since epoch

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::types::Message;

pub const LEN_PREFIX: usize = 4;
/// Frames declaring more than this are a protocol violation that closes the
/// connection; nothing legitimate on this protocol comes close.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const NULL_FIELD: u32 = 0xFFFF_FFFF;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("declared frame length {0} exceeds {MAX_FRAME_LEN}")]
    TooLarge(u32),
}

/// Encode one record as a complete wire frame, length prefix included.
pub fn encode(msg: &Message) -> Bytes {
    let mut body = BytesMut::with_capacity(32 + msg.payload_bytes().len());
    body.put_u8(msg.kind);
    put_string(&mut body, msg.sender.as_deref());
    put_string(&mut body, msg.recipient.as_deref());
    put_bytes(&mut body, msg.payload.as_deref());
    body.put_i64(msg.timestamp_ms);

    let mut out = BytesMut::with_capacity(LEN_PREFIX + body.len());
    out.put_u32(body.len() as u32);
    out.extend_from_slice(&body);
    out.freeze()
}

fn put_string(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        None => buf.put_u32(NULL_FIELD),
        Some(s) => {
            let units: Vec<u16> = s.encode_utf16().collect();
            buf.put_u32((units.len() * 2) as u32);
            for unit in units {
                buf.put_u16(unit);
            }
        }
    }
}

fn put_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        None => buf.put_u32(NULL_FIELD),
        Some(b) => {
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
    }
}

/// Decode the body of a frame (everything after the length prefix).
///
/// Trailing bytes after the timestamp are tolerated, matching the reference
/// serializer, which never checks for them.
pub fn decode_body(mut body: &[u8]) -> Option<Message> {
    let kind = take_u8(&mut body)?;
    let sender = take_string(&mut body)?;
    let recipient = take_string(&mut body)?;
    let payload = take_bytes(&mut body)?;
    let timestamp_ms = take_i64(&mut body)?;
    Some(Message { kind, sender, recipient, payload, timestamp_ms })
}

fn take_u8(buf: &mut &[u8]) -> Option<u8> {
    let (&first, rest) = buf.split_first()?;
    *buf = rest;
    Some(first)
}

fn take_u32(buf: &mut &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    let (raw, rest) = buf.split_at(4);
    *buf = rest;
    Some(u32::from_be_bytes(raw.try_into().expect("4-byte slice")))
}

fn take_i64(buf: &mut &[u8]) -> Option<i64> {
    if buf.len() < 8 {
        return None;
    }
    let (raw, rest) = buf.split_at(8);
    *buf = rest;
    Some(i64::from_be_bytes(raw.try_into().expect("8-byte slice")))
}

fn take_string(buf: &mut &[u8]) -> Option<Option<String>> {
    let len = take_u32(buf)?;
    if len == NULL_FIELD {
        return Some(None);
    }
    let len = len as usize;
    if len % 2 != 0 || buf.len() < len {
        return None;
    }
    let (raw, rest) = buf.split_at(len);
    *buf = rest;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok().map(Some)
}

fn take_bytes(buf: &mut &[u8]) -> Option<Option<Bytes>> {
    let len = take_u32(buf)?;
    if len == NULL_FIELD {
        return Some(None);
    }
    let len = len as usize;
    if buf.len() < len {
        return None;
    }
    let (raw, rest) = buf.split_at(len);
    *buf = rest;
    Some(Some(Bytes::copy_from_slice(raw)))
}

/// Outcome of one [`FrameBuffer::next`] step.
#[derive(Debug)]
pub enum Decoded {
    /// Not enough buffered bytes for a full frame yet.
    NeedMore,
    /// One complete record, removed from the buffer.
    Frame(Message),
    /// A complete frame was removed from the buffer but its body did not
    /// decode; the stream stays in sync.
    Malformed,
}

/// Per-connection receive buffer. Feed it socket reads in whatever pieces
/// they arrive; it yields exactly one record per well-delimited frame.
#[derive(Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next(&mut self) -> Result<Decoded, FrameError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(Decoded::NeedMore);
        }
        let declared = u32::from_be_bytes(self.buf[..LEN_PREFIX].try_into().expect("4-byte slice"));
        if declared as usize > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(declared));
        }
        let total = declared as usize + LEN_PREFIX;
        if self.buf.len() < total {
            return Ok(Decoded::NeedMore);
        }
        let frame = self.buf.split_to(total);
        match decode_body(&frame[LEN_PREFIX..]) {
            Some(msg) => Ok(Decoded::Frame(msg)),
            None => Ok(Decoded::Malformed),
        }
    }
}
