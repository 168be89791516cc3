//! Client-side handshake driver: turns a [`ClientConfig`] and a
//! destination into a [`Connection`], owning the
//! `CLIENT_HELLO`/`SERVER_HELLO`/`CHALLENGE_RESP` exchange before handing
//! off to the steady-state state machine.

use std::time::Instant;

use crate::{
    config::ClientConfig,
    connection::Connection,
    crypto::{EphemeralKeyPair, SessionKey},
    error::ConnectError,
    handshake::{ChallengeResp, ClientHello, ServerHello, PROTOCOL_VERSION},
    header::{Direction, PacketHeader, PacketType, HEADER_LEN},
    seq::SeqNum,
};

/// Drives a single outbound connection attempt from the client's side.
///
/// Like [`Connection`], this is sans-IO: [`Self::send_hello`] returns the
/// first datagram to send, [`Self::on_datagram`] is fed whatever comes
/// back, and once it yields a [`Connection`] the handshake driver is done.
pub struct ClientHandshake {
    config: ClientConfig,
    ephemeral: EphemeralKeyPair,
    start: Instant,
}

/// What happened after feeding a datagram to an in-progress handshake.
pub enum HandshakeStep {
    /// Not yet a `SERVER_HELLO`; keep calling
    /// [`ClientHandshake::on_datagram`] with later datagrams.
    Continue,
    /// `SERVER_HELLO` was valid: here is the live connection (the client
    /// is optimistically connected the moment it sends `CHALLENGE_RESP`;
    /// if the server never receives or accepts it, the connection simply
    /// times out like any other silent peer) and the `CHALLENGE_RESP`
    /// datagram to send it.
    Connected(Connection, Vec<u8>),
}

impl ClientHandshake {
    /// Starts a new handshake attempt, generating a fresh ephemeral key
    /// pair. Returns the driver and the `CLIENT_HELLO` datagram to send.
    #[must_use]
    pub fn start(config: ClientConfig, now: Instant) -> (Self, Vec<u8>) {
        let ephemeral = EphemeralKeyPair::generate();
        let hello = ClientHello {
            protocol_version: PROTOCOL_VERSION,
            client_public_key: ephemeral.public_key_compressed(),
        };
        let header = PacketHeader {
            direction: Direction::ToServer,
            ctime: 0,
            seq: SeqNum::FIRST,
            ack: SeqNum::INVALID,
            pkt_type: PacketType::ClientHello,
            length: 0,
            count: 0,
            ack_bits: 0,
        };
        let mut datagram = header.to_bytes().to_vec();
        datagram.extend_from_slice(&hello.encode());
        (Self { config, ephemeral, start: now }, datagram)
    }

    /// Feeds in a datagram received while handshaking. Expected to be a
    /// `SERVER_HELLO`; anything else is ignored (the caller should keep
    /// waiting or eventually time out via its own clock).
    pub fn on_datagram(self, data: &[u8], now: Instant) -> Result<HandshakeStep, ConnectError> {
        let header = PacketHeader::decode_expecting(data, Direction::ToClient)
            .map_err(|_| ConnectError::Timeout)?;
        if header.pkt_type != PacketType::ServerHello {
            return Ok(HandshakeStep::Continue);
        }
        let body = &data[HEADER_LEN..];
        let server_hello = ServerHello::decode(body, &self.config.server_root_key)?;

        let session_key_bytes = self
            .ephemeral
            .derive_session_key(&server_hello.server_public_key, &server_hello.salt)?;
        let session_key = SessionKey::new(session_key_bytes);

        let challenge_header = PacketHeader {
            direction: Direction::ToServer,
            ctime: now.saturating_duration_since(self.start).as_millis() as u32,
            seq: SeqNum::FIRST,
            ack: SeqNum::INVALID,
            pkt_type: PacketType::ChallengeResp,
            length: 0,
            count: 0,
            ack_bits: 0,
        };
        let resp = ChallengeResp::seal(
            &server_hello.challenge_token,
            &session_key,
            &challenge_header.nonce(),
            &challenge_header.to_bytes(),
        );
        let mut datagram = challenge_header.to_bytes().to_vec();
        datagram.extend_from_slice(&resp.sealed_token);

        let connection = Connection::established(
            true,
            session_key,
            self.config.mtu,
            self.config.message_timeout,
            self.config.connection_timeout,
            self.config.keep_alive_interval,
            now,
        );

        Ok(HandshakeStep::Connected(connection, datagram))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RootVerifyingKey;

    const PUBLIC_PEM: &str = include_str!("../testdata/root_key_spki.pub.pem");

    #[test]
    fn start_produces_client_hello_header() {
        let key = RootVerifyingKey::from_public_key_pem(PUBLIC_PEM).unwrap();
        let config = ClientConfig::new(key);
        let now = Instant::now();
        let (_driver, datagram) = ClientHandshake::start(config, now);
        let header = PacketHeader::decode_expecting(&datagram, Direction::ToServer).unwrap();
        assert_eq!(header.pkt_type, PacketType::ClientHello);
    }
}
