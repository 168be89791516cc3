//! P-256 key material, ECDH/HKDF session key derivation, and AES-256-GCM AEAD.
//!
//! These are thin wrappers over `p256`, `hkdf`, `sha2` and `aes-gcm` that
//! give the handshake (see [`crate::handshake`]) and the per-packet codec
//! (see [`crate::header`]) exactly the operations spec'd in §6: compressed
//! P-256 public keys, ECDSA-SHA256 signatures, HKDF-SHA256 with a fixed info
//! string, and AES-256-GCM with a 12-byte nonce and 16-byte tag.

mod aead;
mod keys;

pub use aead::*;
pub use keys::*;

/// Length in bytes of a compressed P-256 public key (SEC1, `0x02`/`0x03`
/// prefix + 32-byte x-coordinate).
pub const PUBLIC_KEY_LEN: usize = 33;

/// Length in bytes of a derived session key (AES-256 key).
pub const SESSION_KEY_LEN: usize = 32;

/// `info` parameter for HKDF-SHA256 session key derivation, per spec.md §4.3.
pub const HKDF_INFO: &[u8] = b"mpgs/session/v1";
