//! Sealed-envelope codec.
//!
//! Converts small structured values into opaque, URL-safe strings the
//! server can later reopen and trust. Continuations, codes, access
//! tokens, refresh tokens, and tickets all travel this way, which keeps
//! the server free of per-request session state.
//!
//! Layout of a packed envelope, before base64url encoding:
//! `nonce (12 bytes) || AES-256-GCM ciphertext+tag` over the JSON
//! serialization of the value. A fresh random nonce per pack makes the
//! output non-deterministic even for identical payloads.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq)]
pub enum EnvelopeError {
    /// The string is not an envelope this server produced, has been
    /// tampered with, or was sealed under a different secret. Opening
    /// failures are deliberately indistinguishable.
    #[error("invalid envelope")]
    InvalidEnvelope,
}

/// Codec for packing and unpacking sealed envelopes under one secret.
///
/// Stateless once constructed; the secret is loaded at process start
/// and never rotated while issued envelopes are outstanding.
#[derive(Clone)]
pub struct EnvelopeCodec {
    cipher: Aes256Gcm,
}

impl EnvelopeCodec {
    /// Build a codec from the configured encryption secret. The secret
    /// is an arbitrary operator-chosen string; the AES key is its
    /// SHA-256 digest.
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Seal a value into an opaque URL-safe string.
    pub fn pack<T: Serialize>(&self, value: &T) -> Result<String, EnvelopeError> {
        let plaintext =
            serde_json::to_vec(value).map_err(|_| EnvelopeError::InvalidEnvelope)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| EnvelopeError::InvalidEnvelope)?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(packed))
    }

    /// Open a sealed string back into its value. Any failure (bad
    /// encoding, truncation, wrong key, tampering, unparseable payload)
    /// collapses to `InvalidEnvelope`.
    pub fn unpack<T: DeserializeOwned>(&self, sealed: &str) -> Result<T, EnvelopeError> {
        let packed = URL_SAFE_NO_PAD
            .decode(sealed)
            .map_err(|_| EnvelopeError::InvalidEnvelope)?;
        if packed.len() <= NONCE_LEN {
            return Err(EnvelopeError::InvalidEnvelope);
        }

        let (nonce_bytes, ciphertext) = packed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| EnvelopeError::InvalidEnvelope)?;

        serde_json::from_slice(&plaintext).map_err(|_| EnvelopeError::InvalidEnvelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
    struct Payload {
        id: String,
        scopes: Vec<String>,
        exp: Option<i64>,
    }

    fn sample() -> Payload {
        Payload {
            id: "0b18cbdd-11cf-4d00-a01e-bd2a0c3e15c5".to_string(),
            scopes: vec!["profile".to_string(), "email".to_string()],
            exp: Some(1_700_000_000),
        }
    }

    #[test]
    fn test_round_trip() {
        let codec = EnvelopeCodec::new("correct horse battery staple");
        let sealed = codec.pack(&sample()).unwrap();
        let opened: Payload = codec.unpack(&sealed).unwrap();
        assert_eq!(opened, sample());
    }

    #[test]
    fn test_output_is_url_safe() {
        let codec = EnvelopeCodec::new("secret");
        let sealed = codec.pack(&sample()).unwrap();
        assert!(sealed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_pack_is_non_deterministic() {
        let codec = EnvelopeCodec::new("secret");
        let a = codec.pack(&sample()).unwrap();
        let b = codec.pack(&sample()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let codec = EnvelopeCodec::new("secret one");
        let other = EnvelopeCodec::new("secret two");
        let sealed = codec.pack(&sample()).unwrap();
        let result: Result<Payload, _> = other.unpack(&sealed);
        assert_eq!(result.unwrap_err(), EnvelopeError::InvalidEnvelope);
    }

    #[test]
    fn test_tampering_fails() {
        let codec = EnvelopeCodec::new("secret");
        let sealed = codec.pack(&sample()).unwrap();

        // Flip one character somewhere in the ciphertext body.
        let mut chars: Vec<char> = sealed.chars().collect();
        let mid = chars.len() / 2;
        chars[mid] = if chars[mid] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();

        let result: Result<Payload, _> = codec.unpack(&tampered);
        assert!(result.is_err());
    }

    #[test]
    fn test_garbage_inputs_fail() {
        let codec = EnvelopeCodec::new("secret");
        for junk in ["", "a", "!!!not-base64!!!", "AAAA", "0123456789ab"] {
            let result: Result<Payload, _> = codec.unpack(junk);
            assert_eq!(result.unwrap_err(), EnvelopeError::InvalidEnvelope);
        }
    }
}
