use hkdf::Hkdf;
use p256::{
    ecdh::EphemeralSecret,
    ecdsa::{signature::Signer, signature::Verifier, Signature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    PublicKey,
};
use rand::rngs::OsRng;
use sha2::Sha256;

use super::{HKDF_INFO, PUBLIC_KEY_LEN, SESSION_KEY_LEN};

/// Errors that can occur while loading or using key material.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The PEM text was not a valid PKCS#8 private key.
    #[error("invalid root private key PEM")]
    InvalidPrivateKeyPem,
    /// The PEM text was not a valid SubjectPublicKeyInfo public key.
    #[error("invalid root public key PEM")]
    InvalidPublicKeyPem,
    /// A compressed public key could not be parsed.
    #[error("invalid compressed public key")]
    InvalidPublicKeyBytes,
    /// A signature failed to parse from its wire bytes.
    #[error("invalid signature bytes")]
    InvalidSignatureBytes,
    /// Signature verification failed.
    #[error("signature verification failed")]
    VerificationFailed,
}

/// The server's long-lived root signing key, used to authenticate
/// `SERVER_HELLO` (spec.md §4.3). Loaded once at startup from PKCS#8 PEM.
#[derive(Clone)]
pub struct RootSigningKey(SigningKey);

impl RootSigningKey {
    /// Parses a PKCS#8 PEM-encoded P-256 private key.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, KeyError> {
        SigningKey::from_pkcs8_pem(pem)
            .map(Self)
            .map_err(|_| KeyError::InvalidPrivateKeyPem)
    }

    /// Signs `msg` with ECDSA-SHA256, returning the fixed-size signature
    /// bytes (no DER framing).
    #[must_use]
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        let sig: Signature = self.0.sign(msg);
        sig.to_bytes().into()
    }

    /// Derives the public half of this key, for comparison with a pinned
    /// [`RootVerifyingKey`] or for distribution to clients.
    #[must_use]
    pub fn verifying_key(&self) -> RootVerifyingKey {
        RootVerifyingKey(*self.0.verifying_key())
    }
}

/// The root public key a client pins in its [`Config`](crate::config::Config)
/// to authenticate the server during the handshake.
#[derive(Clone)]
pub struct RootVerifyingKey(VerifyingKey);

impl RootVerifyingKey {
    /// Parses a SubjectPublicKeyInfo PEM-encoded P-256 public key.
    pub fn from_public_key_pem(pem: &str) -> Result<Self, KeyError> {
        VerifyingKey::from_public_key_pem(pem)
            .map(Self)
            .map_err(|_| KeyError::InvalidPublicKeyPem)
    }

    /// Verifies a 64-byte ECDSA-SHA256 signature over `msg`.
    pub fn verify(&self, msg: &[u8], sig_bytes: &[u8]) -> Result<(), KeyError> {
        let sig = Signature::try_from(sig_bytes).map_err(|_| KeyError::InvalidSignatureBytes)?;
        self.0
            .verify(msg, &sig)
            .map_err(|_| KeyError::VerificationFailed)
    }
}

/// A fresh P-256 key pair generated once per handshake attempt (client
/// ephemeral, or server ephemeral), never reused across connections.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generates a new ephemeral key pair from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Returns this key pair's public key in compressed SEC1 form.
    #[must_use]
    pub fn public_key_compressed(&self) -> [u8; PUBLIC_KEY_LEN] {
        let point = self.public.to_encoded_point(true);
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Performs ECDH with a peer's compressed public key and derives a
    /// 32-byte session key via `HKDF-SHA256(shared_secret, salt, info)`.
    pub fn derive_session_key(
        &self,
        peer_public_compressed: &[u8],
        salt: &[u8],
    ) -> Result<[u8; SESSION_KEY_LEN], KeyError> {
        let peer_public = PublicKey::from_sec1_bytes(peer_public_compressed)
            .map_err(|_| KeyError::InvalidPublicKeyBytes)?;
        let shared = self.secret.diffie_hellman(&peer_public);
        let hk = Hkdf::<Sha256>::new(Some(salt), shared.raw_secret_bytes());
        let mut key = [0u8; SESSION_KEY_LEN];
        hk.expand(HKDF_INFO, &mut key)
            .expect("HKDF-SHA256 output length is always valid for 32 bytes");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE_PEM: &str = include_str!("../../testdata/root_key_pkcs8.pem");
    const PUBLIC_PEM: &str = include_str!("../../testdata/root_key_spki.pub.pem");

    #[test]
    fn sign_and_verify_round_trip() {
        let signing = RootSigningKey::from_pkcs8_pem(PRIVATE_PEM).unwrap();
        let verifying = RootVerifyingKey::from_public_key_pem(PUBLIC_PEM).unwrap();
        let msg = b"server_hello payload";
        let sig = signing.sign(msg);
        verifying.verify(msg, &sig).unwrap();
    }

    #[test]
    fn tampered_message_fails_verification() {
        let signing = RootSigningKey::from_pkcs8_pem(PRIVATE_PEM).unwrap();
        let verifying = RootVerifyingKey::from_public_key_pem(PUBLIC_PEM).unwrap();
        let sig = signing.sign(b"server_hello payload");
        assert!(verifying.verify(b"server_hello PAYLOAD", &sig).is_err());
    }

    #[test]
    fn ecdh_produces_matching_keys_on_both_sides() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let salt = [7u8; 16];

        let key_from_a = a
            .derive_session_key(&b.public_key_compressed(), &salt)
            .unwrap();
        let key_from_b = b
            .derive_session_key(&a.public_key_compressed(), &salt)
            .unwrap();
        assert_eq!(key_from_a, key_from_b);
    }
}
