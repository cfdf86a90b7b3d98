//! Wire codec.
//!
//! Frames begin with a 1-byte type tag. Four shapes exist on the wire:
//!
//! ```text
//! Hello (CLIENT_HELLO / SERVER_HELLO), 77 bytes:
//! +0   Tag (1)
//! +1   Ephemeral public key (32)
//! +33  Random IV (12)
//! +45  HMAC-SHA256 under the network key (32)
//!
//! Encrypted (all session- and broadcast-keyed types):
//! +0   Tag (1)
//! +1   Key epoch (1)
//! +2   Counter (2, LE)
//! +4   AEAD nonce (12)
//! +16  Ciphertext ‖ Poly1305 tag (16)
//!
//! UNENCRYPTED_NODE_DATA:
//! +0   Tag (1)
//! +1   Counter (2, LE)
//! +3   Encoding (1) ‖ payload
//!
//! INVALIDATE_KEY, 34 bytes:
//! +0   Tag (1)
//! +1   Reason (1)
//! +2   HMAC-SHA256 under the network key (32)
//! ```
//!
//! The decoder rejects anything short, over MTU or with an unknown tag before
//! touching field contents, so allocation is bounded by the MTU.

use crate::error::FrameError;
use crate::types::{
    InvalidateReason, Mac, ADDR_LEN, HMAC_LENGTH, IV_LENGTH, KEY_LENGTH, MAX_MESSAGE_LENGTH,
    TAG_LENGTH,
};

/// Fixed length of hello frames.
pub const HELLO_LEN: usize = 1 + KEY_LENGTH + IV_LENGTH + HMAC_LENGTH;
/// Fixed length of invalidate-key frames.
pub const INVALIDATE_LEN: usize = 2 + HMAC_LENGTH;
/// Header bytes preceding the sealed region of an encrypted frame.
pub const ENCRYPTED_HEADER_LEN: usize = 4 + IV_LENGTH;
/// Smallest valid encrypted frame (empty plaintext).
pub const ENCRYPTED_MIN_LEN: usize = ENCRYPTED_HEADER_LEN + TAG_LENGTH;
/// Largest plaintext an encrypted data frame can carry.
pub const MAX_DATA_PAYLOAD: usize = MAX_MESSAGE_LENGTH - ENCRYPTED_MIN_LEN;
/// AAD length: tag ‖ src ‖ dst ‖ key_id ‖ counter.
pub const AAD_LEN: usize = 1 + 2 * ADDR_LEN + 1 + 2;

/// Message type tag, first byte of every frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    SensorData = 0x01,
    SensorBroadcastData = 0x81,
    UnencryptedNodeData = 0x11,
    DownstreamDataSet = 0x02,
    DownstreamDataGet = 0x12,
    DownstreamBroadcastDataSet = 0x82,
    DownstreamBroadcastDataGet = 0x92,
    ControlData = 0x03,
    DownstreamCtrlData = 0x04,
    DownstreamBroadcastCtrlData = 0x84,
    ClockRequest = 0x05,
    ClockResponse = 0x06,
    NodeNameSet = 0x07,
    NodeNameResult = 0x17,
    HaDiscovery = 0x08,
    BroadcastKeyRequest = 0x28,
    BroadcastKeyResponse = 0x18,
    ClientHello = 0xFF,
    ServerHello = 0xFE,
    InvalidateKey = 0xFB,
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(Self::SensorData),
            0x81 => Ok(Self::SensorBroadcastData),
            0x11 => Ok(Self::UnencryptedNodeData),
            0x02 => Ok(Self::DownstreamDataSet),
            0x12 => Ok(Self::DownstreamDataGet),
            0x82 => Ok(Self::DownstreamBroadcastDataSet),
            0x92 => Ok(Self::DownstreamBroadcastDataGet),
            0x03 => Ok(Self::ControlData),
            0x04 => Ok(Self::DownstreamCtrlData),
            0x84 => Ok(Self::DownstreamBroadcastCtrlData),
            0x05 => Ok(Self::ClockRequest),
            0x06 => Ok(Self::ClockResponse),
            0x07 => Ok(Self::NodeNameSet),
            0x17 => Ok(Self::NodeNameResult),
            0x08 => Ok(Self::HaDiscovery),
            0x28 => Ok(Self::BroadcastKeyRequest),
            0x18 => Ok(Self::BroadcastKeyResponse),
            0xFF => Ok(Self::ClientHello),
            0xFE => Ok(Self::ServerHello),
            0xFB => Ok(Self::InvalidateKey),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

impl MessageType {
    /// True for frames sealed under the broadcast key rather than a session
    /// key.
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            Self::SensorBroadcastData
                | Self::DownstreamBroadcastDataSet
                | Self::DownstreamBroadcastDataGet
                | Self::DownstreamBroadcastCtrlData
        )
    }

    /// True for control-plane frames carried inside the encrypted channel.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::ControlData | Self::DownstreamCtrlData | Self::DownstreamBroadcastCtrlData
        )
    }

    /// True for frames travelling gateway → node.
    pub fn is_downstream(&self) -> bool {
        matches!(
            self,
            Self::DownstreamDataSet
                | Self::DownstreamDataGet
                | Self::DownstreamBroadcastDataSet
                | Self::DownstreamBroadcastDataGet
                | Self::DownstreamCtrlData
                | Self::DownstreamBroadcastCtrlData
                | Self::ClockResponse
                | Self::NodeNameResult
                | Self::BroadcastKeyResponse
                | Self::ServerHello
                | Self::InvalidateKey
        )
    }
}

/// Body of a CLIENT_HELLO or SERVER_HELLO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloBody {
    pub public_key: [u8; KEY_LENGTH],
    pub iv: [u8; IV_LENGTH],
    pub hmac: [u8; HMAC_LENGTH],
}

/// Any frame carried inside the AEAD channel, before decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFrame {
    pub msg_type: MessageType,
    pub key_id: u8,
    pub counter: u16,
    pub nonce: [u8; IV_LENGTH],
    /// Ciphertext followed by the 16-byte Poly1305 tag.
    pub sealed: Vec<u8>,
}

/// Decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ClientHello(HelloBody),
    ServerHello(HelloBody),
    Encrypted(EncryptedFrame),
    UnencryptedData { counter: u16, payload: Vec<u8> },
    InvalidateKey { reason: InvalidateReason, hmac: [u8; HMAC_LENGTH] },
}

/// Builds the additional authenticated data binding a frame to its type,
/// endpoints, key epoch and counter. Splicing any of them breaks the tag.
pub fn build_aad(
    msg_type: MessageType,
    src: &Mac,
    dst: &Mac,
    key_id: u8,
    counter: u16,
) -> [u8; AAD_LEN] {
    let mut aad = [0u8; AAD_LEN];
    aad[0] = msg_type as u8;
    aad[1..7].copy_from_slice(src.as_bytes());
    aad[7..13].copy_from_slice(dst.as_bytes());
    aad[13] = key_id;
    aad[14..16].copy_from_slice(&counter.to_le_bytes());
    aad
}

/// Parses a raw frame, validating every length before any field is read.
pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
    if buf.is_empty() {
        return Err(FrameError::TooShort { len: 0, min: 1 });
    }
    if buf.len() > MAX_MESSAGE_LENGTH {
        return Err(FrameError::OverMtu {
            len: buf.len(),
            max: MAX_MESSAGE_LENGTH,
        });
    }
    let msg_type = MessageType::try_from(buf[0])?;
    match msg_type {
        MessageType::ClientHello | MessageType::ServerHello => {
            if buf.len() != HELLO_LEN {
                return Err(FrameError::BadField {
                    field: "hello",
                    len: buf.len(),
                });
            }
            let mut public_key = [0u8; KEY_LENGTH];
            public_key.copy_from_slice(&buf[1..1 + KEY_LENGTH]);
            let mut iv = [0u8; IV_LENGTH];
            iv.copy_from_slice(&buf[33..33 + IV_LENGTH]);
            let mut hmac = [0u8; HMAC_LENGTH];
            hmac.copy_from_slice(&buf[45..45 + HMAC_LENGTH]);
            let body = HelloBody {
                public_key,
                iv,
                hmac,
            };
            if msg_type == MessageType::ClientHello {
                Ok(Frame::ClientHello(body))
            } else {
                Ok(Frame::ServerHello(body))
            }
        }
        MessageType::InvalidateKey => {
            if buf.len() != INVALIDATE_LEN {
                return Err(FrameError::BadField {
                    field: "invalidate",
                    len: buf.len(),
                });
            }
            let reason = InvalidateReason::try_from(buf[1])
                .map_err(|_| FrameError::BadField { field: "reason", len: 1 })?;
            let mut hmac = [0u8; HMAC_LENGTH];
            hmac.copy_from_slice(&buf[2..2 + HMAC_LENGTH]);
            Ok(Frame::InvalidateKey { reason, hmac })
        }
        MessageType::UnencryptedNodeData => {
            // Needs counter plus at least the encoding byte.
            if buf.len() < 4 {
                return Err(FrameError::TooShort {
                    len: buf.len(),
                    min: 4,
                });
            }
            let counter = u16::from_le_bytes([buf[1], buf[2]]);
            Ok(Frame::UnencryptedData {
                counter,
                payload: buf[3..].to_vec(),
            })
        }
        _ => {
            if buf.len() < ENCRYPTED_MIN_LEN {
                return Err(FrameError::TooShort {
                    len: buf.len(),
                    min: ENCRYPTED_MIN_LEN,
                });
            }
            let key_id = buf[1];
            let counter = u16::from_le_bytes([buf[2], buf[3]]);
            let mut nonce = [0u8; IV_LENGTH];
            nonce.copy_from_slice(&buf[4..4 + IV_LENGTH]);
            Ok(Frame::Encrypted(EncryptedFrame {
                msg_type,
                key_id,
                counter,
                nonce,
                sealed: buf[ENCRYPTED_HEADER_LEN..].to_vec(),
            }))
        }
    }
}

/// Encodes a hello frame.
pub fn encode_hello(msg_type: MessageType, body: &HelloBody) -> Vec<u8> {
    debug_assert!(matches!(
        msg_type,
        MessageType::ClientHello | MessageType::ServerHello
    ));
    let mut out = Vec::with_capacity(HELLO_LEN);
    out.push(msg_type as u8);
    out.extend_from_slice(&body.public_key);
    out.extend_from_slice(&body.iv);
    out.extend_from_slice(&body.hmac);
    out
}

/// Encodes an encrypted frame, refusing anything that would exceed the MTU.
pub fn encode_encrypted(frame: &EncryptedFrame) -> Result<Vec<u8>, FrameError> {
    let total = ENCRYPTED_HEADER_LEN + frame.sealed.len();
    if total > MAX_MESSAGE_LENGTH {
        return Err(FrameError::PayloadTooLarge {
            len: frame.sealed.len(),
        });
    }
    let mut out = Vec::with_capacity(total);
    out.push(frame.msg_type as u8);
    out.push(frame.key_id);
    out.extend_from_slice(&frame.counter.to_le_bytes());
    out.extend_from_slice(&frame.nonce);
    out.extend_from_slice(&frame.sealed);
    Ok(out)
}

/// Encodes an unencrypted node-data frame.
pub fn encode_unencrypted_data(counter: u16, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let total = 3 + payload.len();
    if total > MAX_MESSAGE_LENGTH {
        return Err(FrameError::PayloadTooLarge { len: payload.len() });
    }
    if payload.is_empty() {
        return Err(FrameError::BadField {
            field: "payload",
            len: 0,
        });
    }
    let mut out = Vec::with_capacity(total);
    out.push(MessageType::UnencryptedNodeData as u8);
    out.extend_from_slice(&counter.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encodes an invalidate-key frame.
pub fn encode_invalidate(reason: InvalidateReason, hmac: &[u8; HMAC_LENGTH]) -> Vec<u8> {
    let mut out = Vec::with_capacity(INVALIDATE_LEN);
    out.push(MessageType::InvalidateKey as u8);
    out.push(reason as u8);
    out.extend_from_slice(hmac);
    out
}
