//! Wire formats shared by the hub server and its clients.
//!
//! Three independent encodings live here:
//! - the length-prefixed control record carried over TCP ([`frame`]),
//! - the fixed-header media datagram carried over UDP ([`media`]),
//! - the deterministic per-user stream id ([`ssrc`]).
//!
//! The control record layout matches the Qt `QDataStream` serializer the
//! desktop clients use (big-endian lengths, UTF-16 strings, `0xFFFFFFFF`
//! marking a null field), so it must not change shape.

pub mod frame;
pub mod media;
pub mod ssrc;
pub mod types;

pub use frame::{Decoded, FrameBuffer, FrameError};
pub use media::{MediaHeader, MEDIA_HEADER_LEN};
pub use ssrc::ssrc_of;
pub use types::{Message, MessageType};
