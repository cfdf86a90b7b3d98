use thiserror::Error;

use crate::types::Mac;

/// Errors raised while parsing or building wire frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("frame exceeds radio MTU: {len} bytes (max {max})")]
    OverMtu { len: usize, max: usize },
    #[error("unknown message type: {0:#04x}")]
    UnknownType(u8),
    #[error("invalid field length for {field}: {len}")]
    BadField { field: &'static str, len: usize },
    #[error("payload too large to encode: {len} bytes")]
    PayloadTooLarge { len: usize },
}

/// Errors raised by the crypto primitives.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("AEAD open failed")]
    DecryptFailed,
    #[error("MAC verification failed")]
    BadMac,
    #[error("key derivation failed")]
    Derivation,
}

/// Central error type for protocol operations.
///
/// Everything the dispatcher can hit is representable here. Internal errors
/// never propagate past the dispatcher; they surface through callbacks or
/// the boolean send result instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("data from unregistered peer {0}")]
    UnknownPeer(Mac),
    #[error("session key expired for {0}")]
    KeyExpired(Mac),
    #[error("counter outside replay window")]
    ReplayReject,
    #[error("stale key epoch: frame carries {got}, session is {current}")]
    StaleKeyId { got: u8, current: u8 },
    #[error("node table full")]
    TableFull,
    #[error("node name already in use")]
    NameTaken,
    #[error("no registered node named {0:?}")]
    NameUnknown(String),
    #[error("node name longer than limit")]
    NameTooLong,
    #[error("node name empty")]
    EmptyName,
    #[error("radio send failed")]
    SendFailed,
    #[error("peer is not registered")]
    NotRegistered,
    #[error("configuration store error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
