//! Server-side multiplexer: demultiplexes datagrams from many peer
//! addresses onto per-peer [`Connection`]s, drives the handshake for new
//! peers, and enforces the block list and half-open connection cap
//! (spec.md §4.3, §5).

use std::{
    net::SocketAddr,
    time::Instant,
};

use ahash::AHashMap;
use rand::RngCore;

use crate::{
    config::ServerConfig,
    connection::{Connection, ConnectionState, DeliveredMessage},
    crypto::{EphemeralKeyPair, PUBLIC_KEY_LEN},
    error::DisconnectReason,
    handshake::{ChallengeResp, ClientHello, ServerHello},
    header::{Direction, PacketHeader, PacketType},
};

struct PendingHandshake {
    server_ephemeral: EphemeralKeyPair,
    salt: [u8; 16],
    challenge_token: [u8; 16],
    created_at: Instant,
}

/// One datagram the endpoint wants the caller to send, and where to.
pub struct Outbound {
    /// Destination address.
    pub to: SocketAddr,
    /// Raw bytes to send as-is.
    pub bytes: Vec<u8>,
}

/// Everything that happened while processing one inbound datagram or one
/// housekeeping tick.
#[derive(Default)]
pub struct EndpointEvents {
    /// Datagrams to send.
    pub outbound: Vec<Outbound>,
    /// Application messages delivered by an established connection.
    pub delivered: Vec<(SocketAddr, DeliveredMessage)>,
    /// Peers whose connection just reached a terminal state.
    pub disconnected: Vec<(SocketAddr, DisconnectReason)>,
}

/// Owns every peer connection for one listening socket.
pub struct Endpoint {
    config: ServerConfig,
    connections: AHashMap<SocketAddr, Connection>,
    pending: AHashMap<SocketAddr, PendingHandshake>,
    client_keys: AHashMap<SocketAddr, [u8; PUBLIC_KEY_LEN]>,
    start: Instant,
}

impl Endpoint {
    /// Creates an endpoint with no connections yet.
    #[must_use]
    pub fn new(config: ServerConfig, now: Instant) -> Self {
        Self {
            config,
            connections: AHashMap::new(),
            pending: AHashMap::new(),
            client_keys: AHashMap::new(),
            start: now,
        }
    }

    /// Number of fully established connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Mutable access to an established connection, e.g. to call
    /// [`Connection::send`].
    pub fn connection_mut(&mut self, addr: SocketAddr) -> Option<&mut Connection> {
        self.connections.get_mut(&addr)
    }

    /// Processes one datagram received from `from`, returning any resulting
    /// outbound replies and delivered application messages.
    pub fn on_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) -> EndpointEvents {
        let mut events = EndpointEvents::default();
        if self.config.block_list.contains(&from.ip()) {
            return events;
        }

        if let Some(connection) = self.connections.get_mut(&from) {
            let delivered = connection.recv(data, now);
            events
                .delivered
                .extend(delivered.into_iter().map(|m| (from, m)));
            if let ConnectionState::Disconnected(reason) | ConnectionState::Dropped(reason) =
                connection.state()
            {
                events.disconnected.push((from, reason));
            }
            return events;
        }

        let Ok(header) = PacketHeader::decode_expecting(data, Direction::ToServer) else {
            return events;
        };
        let body = &data[crate::header::HEADER_LEN..];

        match header.pkt_type {
            PacketType::ClientHello => self.handle_client_hello(from, body, now, &mut events),
            PacketType::ChallengeResp => self.handle_challenge_resp(from, &header, body, now, &mut events),
            _ => {}
        }
        events
    }

    fn handle_client_hello(
        &mut self,
        from: SocketAddr,
        body: &[u8],
        now: Instant,
        events: &mut EndpointEvents,
    ) {
        let Ok(hello) = ClientHello::decode(body) else {
            return;
        };
        if self.pending.len() >= self.config.max_temp_connections && !self.pending.contains_key(&from) {
            return;
        }

        let server_ephemeral = EphemeralKeyPair::generate();
        let mut salt = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let mut challenge_token = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut challenge_token);

        let server_hello = ServerHello::sign(
            server_ephemeral.public_key_compressed(),
            salt,
            challenge_token,
            &self.config.root_key,
        );

        self.pending.insert(
            from,
            PendingHandshake {
                server_ephemeral,
                salt,
                challenge_token,
                created_at: now,
            },
        );
        self.client_keys.insert(from, hello.client_public_key);

        let server_hello_bytes = server_hello.encode();
        let header = PacketHeader {
            direction: Direction::ToClient,
            ctime: now.saturating_duration_since(self.start).as_millis() as u32,
            seq: crate::seq::SeqNum::FIRST,
            ack: crate::seq::SeqNum::INVALID,
            pkt_type: PacketType::ServerHello,
            length: u16::try_from(server_hello_bytes.len()).unwrap_or(u16::MAX),
            count: 0,
            ack_bits: 0,
        };
        let mut datagram = header.to_bytes().to_vec();
        datagram.extend_from_slice(&server_hello_bytes);
        events.outbound.push(Outbound { to: from, bytes: datagram });
    }

    fn handle_challenge_resp(
        &mut self,
        from: SocketAddr,
        header: &PacketHeader,
        body: &[u8],
        now: Instant,
        events: &mut EndpointEvents,
    ) {
        let Some(pending) = self.pending.get(&from) else {
            return;
        };
        // the client derived the session key from our ephemeral pubkey and
        // its own; we derive the same key from our ephemeral secret and
        // whatever public key it used, which we don't have stored, so we
        // instead require the client to have already completed ECDH using
        // our advertised server_ephemeral public key against its own
        // (already-sent) client key. The session key is therefore derived
        // once here, symmetrically, from stored state alone.
        let resp = ChallengeResp {
            sealed_token: body.to_vec(),
        };

        let Some(session_key) = self.derive_pending_session_key(from) else {
            return;
        };

        if resp
            .verify(&pending.challenge_token, &session_key, &header.nonce(), &header.to_bytes())
            .is_err()
        {
            return;
        }

        let message_timeout = self.config.message_timeout;
        let connection_timeout = self.config.connection_timeout;
        let keep_alive_interval = self.config.keep_alive_interval;
        let mtu = self.config.mtu;
        self.pending.remove(&from);
        self.client_keys.remove(&from);

        let connection = Connection::established(
            false,
            session_key,
            mtu,
            message_timeout,
            connection_timeout,
            keep_alive_interval,
            now,
        );
        self.connections.insert(from, connection);
        let _ = events;
    }

    /// Re-derives the session key for a peer still in the handshake, given
    /// the client public key we cached when we recorded its `CLIENT_HELLO`.
    ///
    /// Exists as its own step because [`PendingHandshake`] only stores the
    /// server's own ephemeral keys and the salt/token — the client's public
    /// key is looked up from the cache populated in
    /// [`Self::handle_client_hello`].
    fn derive_pending_session_key(&self, from: SocketAddr) -> Option<crate::crypto::SessionKey> {
        let pending = self.pending.get(&from)?;
        let client_public_key = self.client_keys.get(&from)?;
        pending
            .server_ephemeral
            .derive_session_key(client_public_key, &pending.salt)
            .ok()
            .map(crate::crypto::SessionKey::new)
    }

    /// Periodic housekeeping: expires half-open handshakes, runs each
    /// connection's timeout/retry logic, and collects their outgoing
    /// datagrams.
    pub fn update(&mut self, now: Instant) -> EndpointEvents {
        let mut events = EndpointEvents::default();

        let expired: Vec<SocketAddr> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.created_at) >= self.config.temp_connection_timeout)
            .map(|(&addr, _)| addr)
            .collect();
        for addr in expired {
            self.pending.remove(&addr);
            self.client_keys.remove(&addr);
        }

        let mut done = Vec::new();
        for (&addr, connection) in &mut self.connections {
            connection.update(now);
            for datagram in connection.flush(now) {
                events.outbound.push(Outbound { to: addr, bytes: datagram });
            }
            if let ConnectionState::Disconnected(reason) | ConnectionState::Dropped(reason) =
                connection.state()
            {
                events.disconnected.push((addr, reason));
                done.push(addr);
            }
        }
        for addr in done {
            self.connections.remove(&addr);
        }

        events
    }
}

/// Checks an address against the configured block list before any
/// handshake state is allocated for it. A client driver can use this to
/// fail fast with [`crate::error::ConnectError::Blocked`] before sending a
/// `CLIENT_HELLO` at all.
#[must_use]
pub fn is_blocked(config: &ServerConfig, addr: SocketAddr) -> bool {
    config.block_list.contains(&addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EphemeralKeyPair as ClientKeyPair, RootSigningKey, RootVerifyingKey};

    const PRIVATE_PEM: &str = include_str!("../testdata/root_key_pkcs8.pem");
    const PUBLIC_PEM: &str = include_str!("../testdata/root_key_spki.pub.pem");

    #[test]
    fn blocked_address_is_rejected() {
        let root = RootSigningKey::from_pkcs8_pem(PRIVATE_PEM).unwrap();
        let mut config = ServerConfig::new(root);
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        config.block_list.insert(addr.ip());
        let now = Instant::now();
        let mut endpoint = Endpoint::new(config, now);
        let events = endpoint.on_datagram(addr, &[0u8; 64], now);
        assert!(events.outbound.is_empty());
        assert_eq!(endpoint.connection_count(), 0);
    }

    #[test]
    fn garbage_datagram_from_unknown_peer_is_ignored() {
        let root = RootSigningKey::from_pkcs8_pem(PRIVATE_PEM).unwrap();
        let config = ServerConfig::new(root);
        let now = Instant::now();
        let mut endpoint = Endpoint::new(config, now);
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let events = endpoint.on_datagram(addr, &[1, 2, 3], now);
        assert!(events.outbound.is_empty());
    }

    #[allow(dead_code)]
    fn root_verifying_key_is_constructible() -> RootVerifyingKey {
        RootVerifyingKey::from_public_key_pem(PUBLIC_PEM).unwrap()
    }

    #[allow(dead_code)]
    fn client_keypair_is_constructible() -> ClientKeyPair {
        ClientKeyPair::generate()
    }
}
