//! Handshake key schedule and frame sealing.
//!
//! Both roles run the same algorithm: exchange ephemeral X25519 public keys
//! inside HMAC-authenticated hello frames, derive the session key from the
//! shared secret and both hello IVs, then seal every subsequent frame with
//! ChaCha20-Poly1305. Broadcast keys come from a separate, domain-separated
//! derivation so the two key families can never collide.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{
    self, aead_open, aead_seal, hkdf_derive, hmac_sha256, verify_hmac_sha256, SymmetricKey,
};
use crate::error::CryptoError;
use crate::frame::{build_aad, EncryptedFrame, HelloBody, MessageType};
use crate::types::{
    InvalidateReason, Mac, DIR_BROADCAST, DIR_DOWNSTREAM, DIR_UPSTREAM, IV_LENGTH, KEY_LENGTH,
};

/// KDF label for pairwise session keys.
const SESSION_LABEL: &[u8] = b"EIoT-session";
/// KDF label for the gateway-issued broadcast key.
const BROADCAST_LABEL: &[u8] = b"EIoT-bcast";
/// KDF label for the broadcast nonce prefix, derived from the broadcast key
/// itself so receivers reconstruct it from the distributed key alone.
const BROADCAST_NONCE_LABEL: &[u8] = b"EIoT-bcast-nonce";

/// Derived keying material for one epoch: the AEAD key plus the 4-byte nonce
/// prefix that makes nonces unique per `(key, direction, counter)`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub key: SymmetricKey,
    pub nonce_prefix: [u8; 4],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Next key epoch. Strictly increments mod 256; first registration uses 1.
pub fn next_key_id(previous: u8) -> u8 {
    previous.wrapping_add(1)
}

fn hello_mac(network_key: &[u8; KEY_LENGTH], msg_type: MessageType, body: &HelloBody) -> [u8; 32] {
    hmac_sha256(
        network_key,
        &[&[msg_type as u8], &body.public_key, &body.iv],
    )
}

/// Builds a hello frame body: public key, fresh IV, HMAC under the network
/// key proving knowledge of the network secret.
pub fn build_hello(
    network_key: &[u8; KEY_LENGTH],
    msg_type: MessageType,
    public_key: [u8; KEY_LENGTH],
    iv: [u8; IV_LENGTH],
) -> HelloBody {
    let mut body = HelloBody {
        public_key,
        iv,
        hmac: [0u8; 32],
    };
    body.hmac = hello_mac(network_key, msg_type, &body);
    body
}

/// Verifies a hello frame's HMAC in constant time.
pub fn verify_hello(
    network_key: &[u8; KEY_LENGTH],
    msg_type: MessageType,
    body: &HelloBody,
) -> bool {
    verify_hmac_sha256(
        network_key,
        &[&[msg_type as u8], &body.public_key, &body.iv],
        &body.hmac,
    )
}

/// MAC for an INVALIDATE_KEY frame. The session key may already be gone on
/// either side, so the network key authenticates it.
pub fn invalidate_mac(network_key: &[u8; KEY_LENGTH], reason: InvalidateReason) -> [u8; 32] {
    hmac_sha256(
        network_key,
        &[&[MessageType::InvalidateKey as u8], &[reason as u8]],
    )
}

/// Verifies an INVALIDATE_KEY frame's MAC.
pub fn verify_invalidate(
    network_key: &[u8; KEY_LENGTH],
    reason: InvalidateReason,
    mac: &[u8],
) -> bool {
    verify_hmac_sha256(
        network_key,
        &[&[MessageType::InvalidateKey as u8], &[reason as u8]],
        mac,
    )
}

/// Derives the pairwise session keys from the DH shared secret and both
/// hello IVs. Either side computes the same result.
pub fn derive_session(
    shared: &[u8; KEY_LENGTH],
    node_iv: &[u8; IV_LENGTH],
    gateway_iv: &[u8; IV_LENGTH],
) -> Result<SessionKeys, CryptoError> {
    let mut salt = [0u8; 2 * IV_LENGTH];
    salt[..IV_LENGTH].copy_from_slice(node_iv);
    salt[IV_LENGTH..].copy_from_slice(gateway_iv);
    derive_keys(SESSION_LABEL, shared, &salt)
}

/// Derives the broadcast key for an epoch from the gateway's master secret.
/// Only the gateway runs this; nodes receive the key over the wire.
pub fn derive_broadcast(
    master: &[u8; KEY_LENGTH],
    epoch: u8,
) -> Result<SymmetricKey, CryptoError> {
    let mut key = [0u8; KEY_LENGTH];
    hkdf_derive(BROADCAST_LABEL, master, &[epoch], &mut key)?;
    Ok(SymmetricKey(key))
}

/// Expands a broadcast key into full keying material. The nonce prefix is a
/// function of the key, so every holder of the distributed key computes the
/// same nonces.
pub fn broadcast_session(key: SymmetricKey) -> Result<SessionKeys, CryptoError> {
    let mut nonce_prefix = [0u8; 4];
    hkdf_derive(BROADCAST_NONCE_LABEL, key.as_bytes(), &[], &mut nonce_prefix)?;
    Ok(SessionKeys { key, nonce_prefix })
}

fn derive_keys(label: &[u8], ikm: &[u8], salt: &[u8]) -> Result<SessionKeys, CryptoError> {
    let mut okm = [0u8; KEY_LENGTH + 4];
    hkdf_derive(label, ikm, salt, &mut okm)?;
    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&okm[..KEY_LENGTH]);
    let mut nonce_prefix = [0u8; 4];
    nonce_prefix.copy_from_slice(&okm[KEY_LENGTH..]);
    okm.zeroize();
    Ok(SessionKeys {
        key: SymmetricKey(key),
        nonce_prefix,
    })
}

/// Nonce layout: `prefix(4) ‖ key_id(1) ‖ direction(1) ‖ counter(2, LE) ‖
/// zeros(4)`. Unique per `(key, direction, counter)` because the counter
/// never repeats within an epoch.
pub fn build_nonce(prefix: &[u8; 4], key_id: u8, direction: u8, counter: u16) -> [u8; IV_LENGTH] {
    let mut nonce = [0u8; IV_LENGTH];
    nonce[..4].copy_from_slice(prefix);
    nonce[4] = key_id;
    nonce[5] = direction;
    nonce[6..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// AEAD nonce direction byte implied by the message type.
pub fn direction_of(msg_type: MessageType) -> u8 {
    if msg_type.is_broadcast() {
        DIR_BROADCAST
    } else if msg_type.is_downstream() {
        DIR_DOWNSTREAM
    } else {
        DIR_UPSTREAM
    }
}

/// Seals a plaintext into an encrypted frame under the given keys.
pub fn seal_frame(
    keys: &SessionKeys,
    msg_type: MessageType,
    key_id: u8,
    counter: u16,
    src: &Mac,
    dst: &Mac,
    plaintext: &[u8],
) -> Result<EncryptedFrame, CryptoError> {
    let nonce = build_nonce(&keys.nonce_prefix, key_id, direction_of(msg_type), counter);
    let aad = build_aad(msg_type, src, dst, key_id, counter);
    let sealed = aead_seal(&keys.key, &nonce, &aad, plaintext)?;
    Ok(EncryptedFrame {
        msg_type,
        key_id,
        counter,
        nonce,
        sealed,
    })
}

/// Opens an encrypted frame. The carried nonce must be structurally
/// consistent with the header fields (a spliced header cannot survive the
/// AAD check either, but rejecting early avoids the AEAD work).
pub fn open_frame(
    keys: &SessionKeys,
    frame: &EncryptedFrame,
    src: &Mac,
    dst: &Mac,
) -> Result<Vec<u8>, CryptoError> {
    let expected = build_nonce(
        &keys.nonce_prefix,
        frame.key_id,
        direction_of(frame.msg_type),
        frame.counter,
    );
    if !crypto::constant_time_eq(&expected, &frame.nonce) {
        return Err(CryptoError::DecryptFailed);
    }
    let aad = build_aad(frame.msg_type, src, dst, frame.key_id, frame.counter);
    aead_open(&keys.key, &frame.nonce, &aad, &frame.sealed)
}
