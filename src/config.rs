//! Persistent configuration records.
//!
//! Both endpoints store a small settings record: the gateway keeps its radio
//! channel, network key and network name; a node keeps its gateway address,
//! network key and optional name. Records are bincode-serialized behind a
//! 4-byte little-endian length prefix so partial writes are detectable on
//! load.

use std::io::{Read, Write};
use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::crypto::sha256;
use crate::error::Error;
use crate::types::{Mac, KEY_LENGTH};

/// Gateway settings persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub channel: u8,
    pub network_key: [u8; KEY_LENGTH],
    pub network_name: String,
}

impl GatewayConfig {
    pub fn new(channel: u8, network_key: [u8; KEY_LENGTH], network_name: impl Into<String>) -> Self {
        Self {
            channel,
            network_key,
            network_name: network_name.into(),
        }
    }
}

/// Node settings persisted across deep sleeps and restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub gateway_mac: Mac,
    pub network_key: [u8; KEY_LENGTH],
    pub node_name: Option<String>,
}

impl NodeConfig {
    pub fn new(gateway_mac: Mac, network_key: [u8; KEY_LENGTH]) -> Self {
        Self {
            gateway_mac,
            network_key,
            node_name: None,
        }
    }
}

/// Stretches an operator passphrase into the 32-byte network key.
pub fn network_key_from_passphrase(passphrase: &str) -> [u8; KEY_LENGTH] {
    sha256(passphrase.as_bytes())
}

/// Writes a length-prefixed record.
pub fn store<T: Serialize>(record: &T, mut writer: impl Write) -> Result<(), Error> {
    let payload = bincode::serialize(record).map_err(|e| Error::Config(e.to_string()))?;
    let len = u32::try_from(payload.len()).map_err(|_| Error::Config("record too large".into()))?;
    writer
        .write_all(&len.to_le_bytes())
        .and_then(|_| writer.write_all(&payload))
        .map_err(|e| Error::Config(e.to_string()))
}

/// Reads a length-prefixed record.
pub fn load<T: DeserializeOwned>(mut reader: impl Read) -> Result<T, Error> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Config(e.to_string()))?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| Error::Config(e.to_string()))?;
    bincode::deserialize(&payload).map_err(|e| Error::Config(e.to_string()))
}

/// Stores a record to a file.
pub fn store_file<T: Serialize>(record: &T, path: impl AsRef<Path>) -> Result<(), Error> {
    let file = std::fs::File::create(path).map_err(|e| Error::Config(e.to_string()))?;
    store(record, file)
}

/// Loads a record from a file.
pub fn load_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, Error> {
    let file = std::fs::File::open(path).map_err(|e| Error::Config(e.to_string()))?;
    load(file)
}
