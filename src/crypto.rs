//! Cryptographic primitives.
//!
//! Thin wrappers over audited RustCrypto implementations: X25519 for the
//! ephemeral key agreement, HKDF-SHA256 for domain-separated key derivation,
//! HMAC-SHA256 for handshake authentication, and ChaCha20-Poly1305 for frame
//! encryption. Key material lives in [`SymmetricKey`], which zeroizes on
//! drop.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::types::{HMAC_LENGTH, IV_LENGTH, KEY_LENGTH};

pub use x25519_dalek::{EphemeralSecret, PublicKey};

type HmacSha256 = Hmac<Sha256>;

/// 32-byte symmetric key that is wiped when dropped or invalidated.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey(pub [u8; KEY_LENGTH]);

impl SymmetricKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// A key is only considered present when it has non-zero material.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("SymmetricKey(..)")
    }
}

/// Generates an ephemeral X25519 keypair from the OS CSPRNG.
pub fn generate_keypair() -> (EphemeralSecret, PublicKey) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Completes the Diffie-Hellman exchange, consuming the ephemeral secret.
pub fn shared_secret(secret: EphemeralSecret, peer_public: &[u8; 32]) -> [u8; 32] {
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    *shared.as_bytes()
}

/// Fills `buf` with bytes from the OS CSPRNG.
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Fresh random handshake IV.
pub fn random_iv() -> [u8; IV_LENGTH] {
    let mut iv = [0u8; IV_LENGTH];
    random_bytes(&mut iv);
    iv
}

/// HKDF-SHA256 with an explicit domain-separation label.
///
/// `salt` and `label` separate session keys from broadcast keys: two
/// derivations never collide even for identical input key material.
pub fn hkdf_derive(
    label: &[u8],
    ikm: &[u8],
    salt: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(label, out).map_err(|_| CryptoError::Derivation)
}

/// HMAC-SHA256 over the concatenation of `parts`, keyed with `key`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; HMAC_LENGTH] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Verifies an HMAC-SHA256 value in constant time.
pub fn verify_hmac_sha256(key: &[u8], parts: &[&[u8]], expected: &[u8]) -> bool {
    let computed = hmac_sha256(key, parts);
    constant_time_eq(&computed, expected)
}

/// Constant-time byte-slice comparison. Lengths must match.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// SHA-256 digest, used to stretch the operator passphrase into the network
/// key.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// ChaCha20-Poly1305 seal. Returns `ciphertext ‖ tag`.
pub fn aead_seal(
    key: &SymmetricKey,
    nonce: &[u8; IV_LENGTH],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptFailed)
}

/// ChaCha20-Poly1305 open. `data` is `ciphertext ‖ tag`; any tampering with
/// data, AAD, nonce or key fails verification.
pub fn aead_open(
    key: &SymmetricKey,
    nonce: &[u8; IV_LENGTH],
    aad: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: data, aad })
        .map_err(|_| CryptoError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(seed: u8) -> SymmetricKey {
        SymmetricKey([seed; KEY_LENGTH])
    }

    #[test]
    fn dh_agreement_matches_on_both_sides() {
        let (a_secret, a_public) = generate_keypair();
        let (b_secret, b_public) = generate_keypair();
        let a_shared = shared_secret(a_secret, b_public.as_bytes());
        let b_shared = shared_secret(b_secret, a_public.as_bytes());
        assert_eq!(a_shared, b_shared);
        assert_ne!(a_shared, [0u8; 32]);
    }

    #[test]
    fn aead_round_trip_and_tamper_detection() {
        let key = test_key(7);
        let nonce = [3u8; IV_LENGTH];
        let aad = b"header";
        let sealed = aead_seal(&key, &nonce, aad, b"hello").unwrap();
        assert_eq!(aead_open(&key, &nonce, aad, &sealed).unwrap(), b"hello");

        // Tampered ciphertext.
        let mut bent = sealed.clone();
        bent[0] ^= 0x01;
        assert!(aead_open(&key, &nonce, aad, &bent).is_err());
        // Wrong AAD.
        assert!(aead_open(&key, &nonce, b"other", &sealed).is_err());
        // Wrong nonce.
        assert!(aead_open(&key, &[4u8; IV_LENGTH], aad, &sealed).is_err());
        // Wrong key.
        assert!(aead_open(&test_key(8), &nonce, aad, &sealed).is_err());
    }

    #[test]
    fn hmac_verification() {
        let key = [9u8; KEY_LENGTH];
        let mac = hmac_sha256(&key, &[b"a", b"b"]);
        assert!(verify_hmac_sha256(&key, &[b"a", b"b"], &mac));
        assert!(!verify_hmac_sha256(&key, &[b"a", b"c"], &mac));
        assert!(!verify_hmac_sha256(&[8u8; KEY_LENGTH], &[b"a", b"b"], &mac));
    }

    #[test]
    fn hkdf_is_domain_separated() {
        let ikm = [1u8; 32];
        let salt = [2u8; 24];
        let mut a = [0u8; 36];
        let mut b = [0u8; 36];
        hkdf_derive(b"EIoT-session", &ikm, &salt, &mut a).unwrap();
        hkdf_derive(b"EIoT-bcast", &ikm, &salt, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn constant_time_eq_handles_length_mismatch() {
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(constant_time_eq(b"abc", b"abc"));
    }
}
