//! AES-256-GCM encryption for file and chunk objects.
//!
//! Encrypted payload layout: `nonce (12 B) || ciphertext || GCM tag (16 B)`.
//! No header, no version byte — integrity depends only on the GCM tag and
//! the fact that the filename is the hash of the decoded canonical bytes.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use crate::error::Error;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// A 32-byte AES-256-GCM key. Key lifecycle (generation, storage, rotation)
/// is external to this crate (spec §6).
#[derive(Clone)]
pub struct AesKey([u8; KEY_LEN]);

impl AesKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() != KEY_LEN {
            anyhow::bail!("aes key must be {KEY_LEN} bytes, got {}", bytes.len());
        }
        let mut buf = [0u8; KEY_LEN];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}

/// Encrypt `plaintext` with a fresh random nonce. Returns `nonce || ciphertext`.
pub fn encrypt(key: &AesKey, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| anyhow::anyhow!("aead encryption failed"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a payload produced by [`encrypt`]. `object_id` is only used to
/// annotate the returned error.
pub fn decrypt(key: &AesKey, data: &[u8], object_id: &str) -> Result<Vec<u8>, Error> {
    if data.len() < NONCE_LEN {
        return Err(Error::DecryptFailed(object_id.to_string()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
    cipher
        .decrypt(nonce, &data[NONCE_LEN..])
        .map_err(|_| Error::DecryptFailed(object_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> AesKey {
        AesKey::new([byte; KEY_LEN])
    }

    #[test]
    fn round_trip() {
        let k = key(7);
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let ciphertext = encrypt(&k, plaintext).unwrap();
        let decoded = decrypt(&k, &ciphertext, "test").unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn wrong_key_fails() {
        let ciphertext = encrypt(&key(1), b"secret").unwrap();
        let err = decrypt(&key(2), &ciphertext, "test").unwrap_err();
        assert!(matches!(err, Error::DecryptFailed(_)));
    }

    #[test]
    fn truncated_fails() {
        let err = decrypt(&key(1), b"short", "test").unwrap_err();
        assert!(matches!(err, Error::DecryptFailed(_)));
    }
}
