//! Wire encoding for the three handshake packets (spec.md §4.3):
//! `CLIENT_HELLO`, `SERVER_HELLO`, `CHALLENGE_RESP`.
//!
//! All three travel outside the session key (there isn't one yet), so
//! `CLIENT_HELLO`/`SERVER_HELLO` integrity relies on a CRC32 and a root
//! signature respectively, and `CHALLENGE_RESP` is the first packet sealed
//! under the freshly-derived session key.

use crate::crypto::{RootSigningKey, RootVerifyingKey, SessionKey, KeyError, NONCE_LEN, PUBLIC_KEY_LEN};

/// Current wire protocol version, sent in `CLIENT_HELLO` and checked by the
/// server before anything else.
pub const PROTOCOL_VERSION: u32 = 1;

const SALT_LEN: usize = 16;
const CHALLENGE_TOKEN_LEN: usize = 16;
const SIGNATURE_LEN: usize = 64;

/// Body length of `SERVER_HELLO`: `pubkey(33) + salt(16) + token(16) + sig(64)`.
const SERVER_HELLO_BODY_LEN: usize = PUBLIC_KEY_LEN + SALT_LEN + CHALLENGE_TOKEN_LEN + SIGNATURE_LEN;

/// `CLIENT_HELLO`'s body is zero-padded up to this length (before its CRC32
/// trailer) so that the client, not the server, bears the larger datagram —
/// an unauthenticated peer can otherwise use the handshake as a UDP
/// amplification vector (spec.md §5, Design Notes).
const CLIENT_HELLO_MIN_BODY_LEN: usize = SERVER_HELLO_BODY_LEN;

/// Errors decoding a handshake packet body.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// Body was shorter than the fixed fields require.
    #[error("handshake packet too short")]
    TooShort,
    /// `CLIENT_HELLO`'s CRC32 trailer didn't match its body.
    #[error("client hello failed integrity check")]
    BadCrc,
    /// `protocol_version` did not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    /// `SERVER_HELLO`'s root signature did not verify.
    #[error("server hello signature invalid: {0}")]
    BadSignature(#[from] KeyError),
    /// The compressed public key bytes were malformed.
    #[error("invalid public key bytes")]
    BadPublicKey,
    /// `CHALLENGE_RESP` failed to decrypt/authenticate under the derived
    /// session key.
    #[error("challenge response failed to decrypt")]
    BadChallengeResponse,
}

/// Step 1: client's offer. Unencrypted; integrity-checked with a CRC32, not
/// authenticated (the client isn't proven to exist yet).
#[derive(Debug, Clone)]
pub struct ClientHello {
    /// Wire protocol version the client speaks.
    pub protocol_version: u32,
    /// Client's ephemeral ECDH public key, compressed SEC1 form.
    pub client_public_key: [u8; PUBLIC_KEY_LEN],
}

impl ClientHello {
    /// Encodes this hello, zero-padded and CRC32-trailed to
    /// [`CLIENT_HELLO_MIN_BODY_LEN`] `+ 4` bytes total.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(CLIENT_HELLO_MIN_BODY_LEN + 4);
        body.extend_from_slice(&self.protocol_version.to_be_bytes());
        body.extend_from_slice(&self.client_public_key);
        while body.len() < CLIENT_HELLO_MIN_BODY_LEN {
            body.push(0);
        }
        let crc = crc32fast::hash(&body);
        body.extend_from_slice(&crc.to_be_bytes());
        body
    }

    /// Decodes and integrity-checks a `CLIENT_HELLO` body.
    pub fn decode(body: &[u8]) -> Result<Self, HandshakeError> {
        if body.len() < CLIENT_HELLO_MIN_BODY_LEN + 4 {
            return Err(HandshakeError::TooShort);
        }
        let (payload, crc_bytes) = body.split_at(body.len() - 4);
        let expected_crc = u32::from_be_bytes(crc_bytes.try_into().expect("4 bytes"));
        if crc32fast::hash(payload) != expected_crc {
            return Err(HandshakeError::BadCrc);
        }
        let protocol_version = u32::from_be_bytes(payload[0..4].try_into().expect("4 bytes"));
        if protocol_version != PROTOCOL_VERSION {
            return Err(HandshakeError::UnsupportedVersion(protocol_version));
        }
        let mut client_public_key = [0u8; PUBLIC_KEY_LEN];
        client_public_key.copy_from_slice(&payload[4..4 + PUBLIC_KEY_LEN]);
        Ok(Self {
            protocol_version,
            client_public_key,
        })
    }
}

/// Step 2: server's response. Authenticated with the operator's long-lived
/// root signature so a client can trust it didn't come from an off-path
/// attacker racing the real server's reply.
#[derive(Debug, Clone)]
pub struct ServerHello {
    /// Server's ephemeral ECDH public key, compressed SEC1 form.
    pub server_public_key: [u8; PUBLIC_KEY_LEN],
    /// HKDF salt for session key derivation.
    pub salt: [u8; SALT_LEN],
    /// Random token the client must echo back, encrypted, in
    /// `CHALLENGE_RESP` to prove it can derive the session key.
    pub challenge_token: [u8; CHALLENGE_TOKEN_LEN],
    /// Root signature over everything preceding it in the body.
    pub signature: [u8; SIGNATURE_LEN],
}

impl ServerHello {
    /// Builds and signs a `SERVER_HELLO` with `root_key`.
    #[must_use]
    pub fn sign(
        server_public_key: [u8; PUBLIC_KEY_LEN],
        salt: [u8; SALT_LEN],
        challenge_token: [u8; CHALLENGE_TOKEN_LEN],
        root_key: &RootSigningKey,
    ) -> Self {
        let mut signed_part = Vec::with_capacity(PUBLIC_KEY_LEN + SALT_LEN + CHALLENGE_TOKEN_LEN);
        signed_part.extend_from_slice(&server_public_key);
        signed_part.extend_from_slice(&salt);
        signed_part.extend_from_slice(&challenge_token);
        let signature = root_key.sign(&signed_part);
        Self {
            server_public_key,
            salt,
            challenge_token,
            signature,
        }
    }

    /// Encodes this hello to its fixed [`SERVER_HELLO_BODY_LEN`]-byte body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SERVER_HELLO_BODY_LEN);
        out.extend_from_slice(&self.server_public_key);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.challenge_token);
        out.extend_from_slice(&self.signature);
        out
    }

    /// Decodes a `SERVER_HELLO` body and verifies its root signature.
    pub fn decode(body: &[u8], root_key: &RootVerifyingKey) -> Result<Self, HandshakeError> {
        if body.len() < SERVER_HELLO_BODY_LEN {
            return Err(HandshakeError::TooShort);
        }
        let mut server_public_key = [0u8; PUBLIC_KEY_LEN];
        server_public_key.copy_from_slice(&body[0..PUBLIC_KEY_LEN]);
        let mut off = PUBLIC_KEY_LEN;
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&body[off..off + SALT_LEN]);
        off += SALT_LEN;
        let mut challenge_token = [0u8; CHALLENGE_TOKEN_LEN];
        challenge_token.copy_from_slice(&body[off..off + CHALLENGE_TOKEN_LEN]);
        off += CHALLENGE_TOKEN_LEN;
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&body[off..off + SIGNATURE_LEN]);

        let signed_part = &body[0..PUBLIC_KEY_LEN + SALT_LEN + CHALLENGE_TOKEN_LEN];
        root_key.verify(signed_part, &signature)?;

        Ok(Self {
            server_public_key,
            salt,
            challenge_token,
            signature,
        })
    }
}

/// Step 3: client proves it derived the same session key by encrypting
/// the challenge token back to the server.
#[derive(Debug, Clone)]
pub struct ChallengeResp {
    /// `challenge_token` sealed under the session key, nonce `0`, with the
    /// handshake packet header as AAD — the same sealing convention every
    /// later packet uses, just with a predictable plaintext.
    pub sealed_token: Vec<u8>,
}

impl ChallengeResp {
    /// Seals `challenge_token` under `session_key`.
    #[must_use]
    pub fn seal(
        challenge_token: &[u8; CHALLENGE_TOKEN_LEN],
        session_key: &SessionKey,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
    ) -> Self {
        Self {
            sealed_token: session_key.seal(nonce, aad, challenge_token),
        }
    }

    /// Opens the sealed token and checks it matches `expected`.
    pub fn verify(
        &self,
        expected: &[u8; CHALLENGE_TOKEN_LEN],
        session_key: &SessionKey,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
    ) -> Result<(), HandshakeError> {
        let opened = session_key
            .open(nonce, aad, &self.sealed_token)
            .map_err(|_| HandshakeError::BadChallengeResponse)?;
        if opened == expected {
            Ok(())
        } else {
            Err(HandshakeError::BadChallengeResponse)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE_PEM: &str = include_str!("../testdata/root_key_pkcs8.pem");
    const PUBLIC_PEM: &str = include_str!("../testdata/root_key_spki.pub.pem");

    #[test]
    fn client_hello_round_trip() {
        let hello = ClientHello {
            protocol_version: PROTOCOL_VERSION,
            client_public_key: [7u8; PUBLIC_KEY_LEN],
        };
        let bytes = hello.encode();
        let decoded = ClientHello::decode(&bytes).unwrap();
        assert_eq!(decoded.protocol_version, PROTOCOL_VERSION);
        assert_eq!(decoded.client_public_key, hello.client_public_key);
    }

    #[test]
    fn client_hello_is_at_least_as_large_as_server_hello() {
        let hello = ClientHello {
            protocol_version: PROTOCOL_VERSION,
            client_public_key: [1u8; PUBLIC_KEY_LEN],
        };
        assert!(hello.encode().len() >= SERVER_HELLO_BODY_LEN);
    }

    #[test]
    fn client_hello_rejects_corrupted_crc() {
        let hello = ClientHello {
            protocol_version: PROTOCOL_VERSION,
            client_public_key: [1u8; PUBLIC_KEY_LEN],
        };
        let mut bytes = hello.encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            ClientHello::decode(&bytes),
            Err(HandshakeError::BadCrc)
        ));
    }

    #[test]
    fn client_hello_rejects_wrong_version() {
        let mut hello = ClientHello {
            protocol_version: PROTOCOL_VERSION,
            client_public_key: [1u8; PUBLIC_KEY_LEN],
        };
        hello.protocol_version = 99;
        let bytes = hello.encode();
        assert!(matches!(
            ClientHello::decode(&bytes),
            Err(HandshakeError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn server_hello_round_trip_and_signature() {
        let root = RootSigningKey::from_pkcs8_pem(PRIVATE_PEM).unwrap();
        let verifying = RootVerifyingKey::from_public_key_pem(PUBLIC_PEM).unwrap();
        let hello = ServerHello::sign([2u8; PUBLIC_KEY_LEN], [3u8; SALT_LEN], [4u8; CHALLENGE_TOKEN_LEN], &root);
        let bytes = hello.encode();
        let decoded = ServerHello::decode(&bytes, &verifying).unwrap();
        assert_eq!(decoded.server_public_key, hello.server_public_key);
        assert_eq!(decoded.challenge_token, hello.challenge_token);
    }

    #[test]
    fn server_hello_rejects_tampered_body() {
        let root = RootSigningKey::from_pkcs8_pem(PRIVATE_PEM).unwrap();
        let verifying = RootVerifyingKey::from_public_key_pem(PUBLIC_PEM).unwrap();
        let hello = ServerHello::sign([2u8; PUBLIC_KEY_LEN], [3u8; SALT_LEN], [4u8; CHALLENGE_TOKEN_LEN], &root);
        let mut bytes = hello.encode();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            ServerHello::decode(&bytes, &verifying),
            Err(HandshakeError::BadSignature(_))
        ));
    }

    #[test]
    fn challenge_resp_round_trip() {
        let session_key = SessionKey::new([9u8; 32]);
        let nonce = [1u8; NONCE_LEN];
        let aad = b"header";
        let token = [5u8; CHALLENGE_TOKEN_LEN];
        let resp = ChallengeResp::seal(&token, &session_key, &nonce, aad);
        resp.verify(&token, &session_key, &nonce, aad).unwrap();
    }

    #[test]
    fn challenge_resp_rejects_wrong_token() {
        let session_key = SessionKey::new([9u8; 32]);
        let nonce = [1u8; NONCE_LEN];
        let aad = b"header";
        let token = [5u8; CHALLENGE_TOKEN_LEN];
        let resp = ChallengeResp::seal(&token, &session_key, &nonce, aad);
        let wrong = [6u8; CHALLENGE_TOKEN_LEN];
        assert!(resp.verify(&wrong, &session_key, &nonce, aad).is_err());
    }
}
