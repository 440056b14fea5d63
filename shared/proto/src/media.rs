//! Fixed-header media datagrams on the UDP voice/video ports.
//!
//! Layout (big-endian):
//!   u8  version | u8 media type | u8 codec | u8 flags
//!   u32 ssrc
//!   u32 timestamp, milliseconds (wraps ~49 days; use seq for ordering)
//!   u16 seq
//!   u16 payload length
//!   payload bytes
//!
//! The forwarder validates this structurally, rewrites the ssrc field and
//! leaves everything else untouched.

use bytes::{BufMut, Bytes, BytesMut};

pub const MEDIA_HEADER_LEN: usize = 16;
pub const MEDIA_TYPE_VOICE: u8 = 0;
pub const MEDIA_TYPE_VIDEO: u8 = 1;
pub const FLAG_KEYFRAME: u8 = 1 << 0;
pub const FLAG_MARKER: u8 = 1 << 1;

/// Byte range of the ssrc field inside a packed datagram.
const SSRC_RANGE: std::ops::Range<usize> = 4..8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MediaHeader {
    pub version: u8,
    pub media_type: u8,
    pub codec: u8,
    pub flags: u8,
    pub ssrc: u32,
    pub timestamp_ms: u32,
    pub seq: u16,
    pub payload_len: u16,
}

impl MediaHeader {
    /// Parse a datagram header. Returns `None` when the datagram is shorter
    /// than header plus declared payload; such datagrams are dropped.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        if datagram.len() < MEDIA_HEADER_LEN {
            return None;
        }
        let header = Self {
            version: datagram[0],
            media_type: datagram[1],
            codec: datagram[2],
            flags: datagram[3],
            ssrc: u32::from_be_bytes(datagram[4..8].try_into().expect("4-byte slice")),
            timestamp_ms: u32::from_be_bytes(datagram[8..12].try_into().expect("4-byte slice")),
            seq: u16::from_be_bytes(datagram[12..14].try_into().expect("2-byte slice")),
            payload_len: u16::from_be_bytes(datagram[14..16].try_into().expect("2-byte slice")),
        };
        if datagram.len() < header.wire_len() {
            return None;
        }
        Some(header)
    }

    /// Total datagram length, header included. Trailing bytes beyond this
    /// are junk and never forwarded.
    pub fn wire_len(&self) -> usize {
        MEDIA_HEADER_LEN + self.payload_len as usize
    }

    pub fn pack(&self, payload: &[u8]) -> Bytes {
        debug_assert_eq!(payload.len(), self.payload_len as usize);
        let mut out = BytesMut::with_capacity(MEDIA_HEADER_LEN + payload.len());
        out.put_u8(self.version);
        out.put_u8(self.media_type);
        out.put_u8(self.codec);
        out.put_u8(self.flags);
        out.put_u32(self.ssrc);
        out.put_u32(self.timestamp_ms);
        out.put_u16(self.seq);
        out.put_u16(self.payload_len);
        out.put_slice(payload);
        out.freeze()
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags & FLAG_KEYFRAME != 0
    }

    pub fn is_marker(&self) -> bool {
        self.flags & FLAG_MARKER != 0
    }
}

/// Overwrite the ssrc field of an already-packed datagram in place.
/// The caller guarantees at least a full header is present.
pub fn patch_ssrc(datagram: &mut [u8], ssrc: u32) {
    datagram[SSRC_RANGE].copy_from_slice(&ssrc.to_be_bytes());
}
