use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use zeroize::Zeroize;

use super::SESSION_KEY_LEN;

/// Length in bytes of the AES-GCM nonce: the first 12 bytes of a
/// [`PacketHeader`](crate::header::PacketHeader).
pub const NONCE_LEN: usize = 12;

/// Length in bytes of the AES-GCM authentication tag appended to ciphertext.
pub const TAG_LEN: usize = 16;

/// Failed to decrypt/authenticate a packet body.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("AEAD decryption failed")]
pub struct DecryptError;

/// A derived 256-bit session key, used to seal/open packet bodies under
/// AES-256-GCM.
///
/// The key is held only in memory for the lifetime of a connection and is
/// zeroed on drop, per spec.md §3 and §5.
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Wraps a raw 32-byte key, e.g. the output of
    /// [`EphemeralKeyPair::derive_session_key`](super::EphemeralKeyPair::derive_session_key).
    #[must_use]
    pub const fn new(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Encrypts `plaintext` under this key with the given 12-byte nonce and
    /// additional authenticated data, returning `ciphertext || tag`.
    ///
    /// # Panics
    ///
    /// Panics if the key bytes are rejected by `aes-gcm`, which cannot
    /// happen for a 32-byte key.
    #[must_use]
    pub fn seal(&self, nonce: &[u8; NONCE_LEN], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .expect("AES-256-GCM encryption with a valid key never fails")
    }

    /// Decrypts and authenticates `ciphertext` (which must include the
    /// trailing tag) under this key, the given nonce, and `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`DecryptError`] if authentication fails (tampered body,
    /// tampered AAD, or wrong key) — this covers both malice and bit-rot, and
    /// the caller must treat both the same way: drop the packet silently.
    pub fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, DecryptError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0));
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| DecryptError)
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = SessionKey::new([9u8; SESSION_KEY_LEN]);
        let nonce = [1u8; NONCE_LEN];
        let aad = b"header bytes";
        let sealed = key.seal(&nonce, aad, b"hello world");
        let opened = key.open(&nonce, aad, &sealed).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn tampered_body_fails() {
        let key = SessionKey::new([9u8; SESSION_KEY_LEN]);
        let nonce = [1u8; NONCE_LEN];
        let aad = b"header bytes";
        let mut sealed = key.seal(&nonce, aad, b"hello world");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(key.open(&nonce, aad, &sealed).is_err());
    }

    #[test]
    fn tampered_aad_fails() {
        let key = SessionKey::new([9u8; SESSION_KEY_LEN]);
        let nonce = [1u8; NONCE_LEN];
        let sealed = key.seal(&nonce, b"header bytes", b"hello world");
        assert!(key.open(&nonce, b"header BYTES", &sealed).is_err());
    }
}
