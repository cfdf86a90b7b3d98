//! Protocol-wide constants and small wire types.
//!
//! Everything here is the single source of truth for on-wire values; no other
//! module redefines a tag, length, or reason code.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Radio address length (ESP-NOW style).
pub const ADDR_LEN: usize = 6;
/// Symmetric key length for session, broadcast and network keys.
pub const KEY_LENGTH: usize = 32;
/// Random IV carried in handshake messages.
pub const IV_LENGTH: usize = 12;
/// AEAD authentication tag length (Poly1305).
pub const TAG_LENGTH: usize = 16;
/// Handshake/invalidate HMAC length (HMAC-SHA256, untruncated).
pub const HMAC_LENGTH: usize = 32;
/// Radio MTU. Frames longer than this are rejected before any processing.
pub const MAX_MESSAGE_LENGTH: usize = 250;
/// Longest node name accepted by the gateway.
pub const MAX_NODE_NAME_LENGTH: usize = 32;
/// Node table capacity on the gateway.
pub const MAX_NODES: usize = 100;
/// Replay window: a counter is accepted iff it exceeds the last accepted one
/// by at most this many steps (mod 2^16).
pub const COUNTER_WINDOW: u16 = 256;
/// Counter rejects tolerated in a row before the session is invalidated.
pub const MAX_COUNTER_REJECTS: u8 = 3;
/// Session key lifetime in milliseconds.
pub const MAX_KEY_VALIDITY_MS: u64 = 86_400_000;
/// Handshakes not completed within this window are abandoned.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
/// Queued downstream messages for sleepy nodes expire after this long.
pub const DOWNSTREAM_TTL_MS: u64 = 120_000;
/// Idle peers are evicted after this many times the key validity period.
pub const EVICT_IDLE_FACTOR: u64 = 2;
/// Gateway receive ring depth.
pub const RX_QUEUE_CAPACITY: usize = 16;
/// Secondary overflow area depth for the receive ring.
pub const OVERFLOW_CAPACITY: usize = 15;
/// Delay before the first queued Home Assistant discovery call runs.
pub const HA_FIRST_DISCOVERY_DELAY_MS: u64 = 5_000;
/// Delay between subsequent Home Assistant discovery calls.
pub const HA_NEXT_DISCOVERY_DELAY_MS: u64 = 500;

/// AEAD nonce direction byte, node to gateway.
pub const DIR_UPSTREAM: u8 = 0x00;
/// AEAD nonce direction byte, gateway to node.
pub const DIR_DOWNSTREAM: u8 = 0x01;
/// AEAD nonce direction byte, broadcast frames.
pub const DIR_BROADCAST: u8 = 0x02;

/// 6-byte radio address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, PartialOrd, Ord)]
pub struct Mac(pub [u8; ADDR_LEN]);

impl Mac {
    /// All-ones broadcast address.
    pub const BROADCAST: Mac = Mac([0xFF; ADDR_LEN]);

    pub fn as_bytes(&self) -> &[u8; ADDR_LEN] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl From<[u8; ADDR_LEN]> for Mac {
    fn from(bytes: [u8; ADDR_LEN]) -> Self {
        Mac(bytes)
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Reason carried inside an `InvalidateKey` message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateReason {
    UnknownError = 0x00,
    WrongClientHello = 0x01,
    WrongData = 0x03,
    UnregisteredNode = 0x04,
    KeyExpired = 0x05,
    Kicked = 0x06,
}

impl TryFrom<u8> for InvalidateReason {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x00 => Ok(Self::UnknownError),
            0x01 => Ok(Self::WrongClientHello),
            0x03 => Ok(Self::WrongData),
            0x04 => Ok(Self::UnregisteredNode),
            0x05 => Ok(Self::KeyExpired),
            0x06 => Ok(Self::Kicked),
            other => Err(other),
        }
    }
}

/// Payload encoding tag carried with data messages. Opaque to the protocol
/// core; surfaced to the application callback untouched.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    Raw = 0x00,
    CayenneLpp = 0x81,
    MsgPack = 0x83,
    Enigma = 0xFF,
}

impl TryFrom<u8> for PayloadEncoding {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x00 => Ok(Self::Raw),
            0x81 => Ok(Self::CayenneLpp),
            0x83 => Ok(Self::MsgPack),
            0xFF => Ok(Self::Enigma),
            other => Err(other),
        }
    }
}

/// Result code for a node-name registration attempt, sent back in
/// `NODE_NAME_RESULT`.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameResult {
    Ok = 0,
    AlreadyUsed = -1,
    TooLong = -2,
    Empty = -3,
    MessageError = -4,
}

impl TryFrom<i8> for NameResult {
    type Error = i8;

    fn try_from(value: i8) -> Result<Self, i8> {
        match value {
            0 => Ok(Self::Ok),
            -1 => Ok(Self::AlreadyUsed),
            -2 => Ok(Self::TooLong),
            -3 => Ok(Self::Empty),
            -4 => Ok(Self::MessageError),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_display_is_colon_hex() {
        let mac = Mac([0xAA, 0xBB, 0x0C, 0x01, 0x02, 0x03]);
        assert_eq!(mac.to_string(), "AA:BB:0C:01:02:03");
    }

    #[test]
    fn broadcast_detection() {
        assert!(Mac::BROADCAST.is_broadcast());
        assert!(!Mac([1, 2, 3, 4, 5, 6]).is_broadcast());
    }

    #[test]
    fn invalidate_reason_roundtrip() {
        for raw in [0x00u8, 0x01, 0x03, 0x04, 0x05, 0x06] {
            let reason = InvalidateReason::try_from(raw).unwrap();
            assert_eq!(reason as u8, raw);
        }
        assert!(InvalidateReason::try_from(0x02).is_err());
    }
}
