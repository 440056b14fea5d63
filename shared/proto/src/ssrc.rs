//! Deterministic synchronization-source ids.
//!
//! Both ends derive the ssrc from the username, so a receiver can attribute
//! any datagram to its sender without trusting the sender-written field.

use sha1::{Digest, Sha1};

/// First four bytes of SHA-1 over the UTF-8 username, read big-endian.
/// Zero is reserved and remaps to 1, so the result is never 0.
pub fn ssrc_of(username: &str) -> u32 {
    let digest = Sha1::digest(username.as_bytes());
    from_prefix([digest[0], digest[1], digest[2], digest[3]])
}

fn from_prefix(prefix: [u8; 4]) -> u32 {
    match u32::from_be_bytes(prefix) {
        0 => 1,
        v => v,
    }
}
