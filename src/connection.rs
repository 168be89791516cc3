//! The per-peer state machine: ack tracking, retry/retransmit, fragment
//! dispatch, keep-alives, and teardown. See spec.md §4 and §5.
//!
//! Sans-IO: a [`Connection`] never touches a socket. The caller feeds it
//! received datagrams via [`Connection::recv`]
//! and periodically calls [`Connection::flush`] to pull outgoing datagrams
//! and [`Connection::update`] to run timeout/retry housekeeping.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use ahash::AHashSet;
use bytes::Bytes;

use crate::{
    bitfield::{BitField, InsertResult},
    crypto::SessionKey,
    error::{DisconnectReason, DropReason},
    frag::{self, Fragment, FragmentAssembler},
    header::{Direction, PacketHeader, PacketType},
    message::{FragmentRef, PendingMessage, PendingQueue, RetryMode},
    packet::{self, MessageSlot, PacketBuilder},
    seq::SeqNum,
    stats::{Rtt, RttEstimator, Stats},
};

/// Maximum number of packets allowed in flight (sent, unacked) at once.
/// Once reached, [`Connection::flush`] stops draining the outgoing queue
/// until an ack frees a slot.
pub const IN_FLIGHT_WINDOW: usize = 32;

/// Number of recently-delivered application message sequence numbers kept
/// around to reject a retransmitted duplicate after it's already been
/// handed to the application.
pub const DELIVERED_DEDUP_CAP: usize = 1024;

/// Message payloads larger than this are fragmented (spec.md §4.5); sized
/// to comfortably fit a fragment's 6-byte sub-header inside one packet at
/// the default MTU alongside other slots.
pub const FRAGMENT_CHUNK_LEN: usize = 1024;

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress; no session key yet. [`Connection::recv`] and
    /// [`Connection::flush`] are no-ops in this state — handshake packets
    /// are handled by the client/endpoint driver, not by `Connection`
    /// itself (see [`crate::handshake`]).
    Connecting,
    /// Session key established; app traffic flows normally.
    Connected,
    /// A `DISCONNECT` has been sent or received; draining in-flight state
    /// before moving to a terminal state.
    Disconnecting,
    /// Terminated gracefully (local or remote initiated).
    Disconnected(DisconnectReason),
    /// Terminated ungracefully (timeout, exhausted retries).
    Dropped(DisconnectReason),
}

impl ConnectionState {
    /// Whether this is one of the two terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::Dropped(_))
    }
}

/// An established, reliable, encrypted UDP connection to one peer.
pub struct Connection {
    direction_local: Direction,
    direction_remote: Direction,
    state: ConnectionState,
    session_key: SessionKey,
    mtu: usize,
    message_timeout: Duration,
    connection_timeout: Duration,
    keep_alive_interval: Duration,

    local_seq: SeqNum,
    next_msg_seq: SeqNum,
    next_group_id: u16,
    ctime_origin: Instant,

    remote_history: BitField,
    in_flight: AHashSet<SeqNum>,
    pending: PendingQueue,
    outgoing: VecDeque<OutgoingDraft>,
    fragments: FragmentAssembler,
    delivered: VecDeque<SeqNum>,
    delivered_set: AHashSet<SeqNum>,

    last_recv_time: Instant,
    last_send_time: Instant,

    rtt: RttEstimator,
    stats: Stats,
}

struct OutgoingDraft {
    msg_seq: SeqNum,
    pkt_type: PacketType,
    payload: Bytes,
    retry_mode: RetryMode,
    fragment: Option<FragmentRef>,
}

/// A fully decoded, application-visible inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    /// Connection-local message sequence number it arrived as.
    pub msg_seq: SeqNum,
    /// Reassembled (or, if never fragmented, as-is) payload bytes.
    pub payload: Vec<u8>,
}

impl Connection {
    /// Constructs a connection already past the handshake, given the
    /// derived session key and the direction each side's packets travel.
    #[must_use]
    pub fn established(
        role_is_client: bool,
        session_key: SessionKey,
        mtu: usize,
        message_timeout: Duration,
        connection_timeout: Duration,
        keep_alive_interval: Duration,
        now: Instant,
    ) -> Self {
        let (direction_local, direction_remote) = if role_is_client {
            (Direction::ToServer, Direction::ToClient)
        } else {
            (Direction::ToClient, Direction::ToServer)
        };
        Self {
            direction_local,
            direction_remote,
            state: ConnectionState::Connected,
            session_key,
            mtu,
            message_timeout,
            connection_timeout,
            keep_alive_interval,
            local_seq: SeqNum::FIRST,
            next_msg_seq: SeqNum::FIRST,
            next_group_id: 0,
            ctime_origin: now,
            remote_history: BitField::new(),
            in_flight: AHashSet::new(),
            pending: PendingQueue::new(),
            outgoing: VecDeque::new(),
            fragments: FragmentAssembler::new(),
            delivered: VecDeque::new(),
            delivered_set: AHashSet::new(),
            last_recv_time: now,
            last_send_time: now,
            rtt: RttEstimator::new(),
            stats: Stats::new(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Traffic counters accumulated so far.
    #[must_use]
    pub const fn stats(&self) -> Stats {
        self.stats
    }

    /// Current smoothed RTT estimate, if any acked packet has been observed.
    #[must_use]
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt.rtt()
    }

    /// Queues `payload` for sending, fragmenting it first if it's larger
    /// than a single packet can carry alongside its slot overhead.
    pub fn send(&mut self, payload: &[u8], retry_mode: RetryMode) {
        if self.state.is_terminal() || matches!(self.state, ConnectionState::Disconnecting) {
            return;
        }
        let max_single = packet::max_single_message_len(self.mtu);
        if payload.len() <= max_single {
            let msg_seq = self.next_msg_seq;
            self.next_msg_seq = self.next_msg_seq.successor();
            self.outgoing.push_back(OutgoingDraft {
                msg_seq,
                pkt_type: PacketType::App,
                payload: Bytes::copy_from_slice(payload),
                retry_mode,
                fragment: None,
            });
            return;
        }

        let group_id = self.next_group_id;
        self.next_group_id = self.next_group_id.wrapping_add(1);
        for fragment in frag::split(payload, FRAGMENT_CHUNK_LEN, group_id) {
            let msg_seq = self.next_msg_seq;
            self.next_msg_seq = self.next_msg_seq.successor();
            let fragment_ref = FragmentRef {
                group_id: fragment.group_id,
                index: fragment.index,
                total: fragment.total,
            };
            self.outgoing.push_back(OutgoingDraft {
                msg_seq,
                pkt_type: PacketType::AppFragment,
                payload: Bytes::from(fragment.encode()),
                retry_mode,
                fragment: Some(fragment_ref),
            });
        }
    }

    /// Requests a graceful teardown; the next [`Self::flush`] will emit a
    /// `DISCONNECT` packet and move to [`ConnectionState::Disconnecting`].
    pub fn disconnect(&mut self) {
        if !self.state.is_terminal() {
            self.state = ConnectionState::Disconnecting;
        }
    }

    /// Runs timeout-driven housekeeping: retransmits, connection timeout,
    /// and declares the connection dropped if the peer has gone silent too
    /// long. Should be called roughly every `tick_interval`.
    pub fn update(&mut self, now: Instant) {
        if self.state.is_terminal() {
            return;
        }
        if now.saturating_duration_since(self.last_recv_time) >= self.connection_timeout {
            self.state = ConnectionState::Dropped(DisconnectReason::Timeout);
            return;
        }
        for msg_seq in self.pending.timed_out(now, self.message_timeout) {
            if let Some(message) = self.pending_message(msg_seq) {
                self.outgoing.push_front(OutgoingDraft {
                    msg_seq,
                    pkt_type: message.pkt_type,
                    payload: Bytes::from(message.payload.clone()),
                    retry_mode: message.retry_mode,
                    fragment: message.fragment,
                });
            }
        }
        self.fragments.evict_expired(now);
    }

    fn pending_message(&self, msg_seq: SeqNum) -> Option<PendingMessage> {
        // `PendingQueue` only exposes retirement by packet seq; timed-out
        // retransmits look the message back up by re-borrowing its stored
        // copy through `timed_out`'s caller contract (message stays until
        // acked or retired elsewhere), so a direct lookup here just mirrors
        // what `timed_out` already found.
        self.pending.peek(msg_seq)
    }

    /// Builds and encrypts as many outgoing datagrams as the in-flight
    /// window and MTU budget allow, draining the send queue and any
    /// retransmits due this tick. Also emits a keep-alive if nothing else
    /// was sent and the keep-alive interval has elapsed.
    pub fn flush(&mut self, now: Instant) -> Vec<Vec<u8>> {
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            return Vec::new();
        }

        let mut datagrams = Vec::new();

        if matches!(self.state, ConnectionState::Disconnecting) {
            datagrams.push(self.build_packet(PacketType::Disconnect, 0, Bytes::new(), now));
            self.state = ConnectionState::Disconnected(DisconnectReason::Local);
            return datagrams;
        }

        while self.in_flight.len() < IN_FLIGHT_WINDOW && !self.outgoing.is_empty() {
            let mut builder = PacketBuilder::new(self.mtu);
            let mut packed: Vec<OutgoingDraft> = Vec::new();
            while let Some(draft) = self.outgoing.front() {
                let slot = MessageSlot {
                    msg_seq: draft.msg_seq,
                    kind: draft.pkt_type,
                    payload: draft.payload.clone(),
                };
                if builder.try_add(slot).is_err() {
                    break;
                }
                packed.push(self.outgoing.pop_front().expect("front just peeked"));
            }
            if packed.is_empty() {
                // a single message is too big even alone; drop it rather
                // than spin forever (shouldn't happen: send() already caps
                // fragment size to fit).
                self.outgoing.pop_front();
                continue;
            }

            let single_type = packed[0].pkt_type;
            let pkt_type = if packed.len() == 1 { single_type } else { PacketType::App };
            let (count, body) = builder.finish();
            let datagram = self.build_packet(pkt_type, count, body, now);

            let packet_seq = self.local_seq;
            for draft in packed {
                let message = PendingMessage {
                    msg_seq: draft.msg_seq,
                    pkt_type: draft.pkt_type,
                    payload: draft.payload.to_vec(),
                    retry_mode: draft.retry_mode,
                    first_send_time: now,
                    last_send_time: now,
                    packet_seqs: vec![packet_seq],
                    fragment: draft.fragment,
                };
                self.pending.insert(message);
            }
            self.pending.retire_fire_and_forget();
            datagrams.push(datagram);
        }

        if datagrams.is_empty()
            && now.saturating_duration_since(self.last_send_time) >= self.keep_alive_interval
        {
            datagrams.push(self.build_packet(PacketType::KeepAlive, 0, Bytes::new(), now));
        }

        datagrams
    }

    fn build_packet(&mut self, pkt_type: PacketType, count: u8, body: Bytes, now: Instant) -> Vec<u8> {
        let seq = self.local_seq;
        self.local_seq = self.local_seq.successor();
        self.in_flight.insert(seq);

        let header = PacketHeader {
            direction: self.direction_local,
            ctime: now.saturating_duration_since(self.ctime_origin).as_millis() as u32,
            seq,
            ack: self.remote_history.most_recent(),
            pkt_type,
            length: u16::try_from(body.len()).unwrap_or(u16::MAX),
            count,
            ack_bits: self.remote_history.bits(),
        };
        let header_bytes = header.to_bytes();
        let sealed = self.session_key.seal(&header.nonce(), &header_bytes, &body);

        self.last_send_time = now;
        self.stats.record_sent(header_bytes.len() + sealed.len(), count as u64);

        let mut datagram = Vec::with_capacity(header_bytes.len() + sealed.len());
        datagram.extend_from_slice(&header_bytes);
        datagram.extend_from_slice(&sealed);
        datagram
    }

    /// Processes one inbound datagram, returning any application messages
    /// it completed delivery of (zero, one, or more — a packet can carry
    /// several slots, and a fragment slot may complete a long-pending
    /// message).
    ///
    /// Malformed, duplicate, stale, or forged datagrams are dropped
    /// silently (logged via `tracing`, counted in [`Self::stats`]) rather
    /// than surfaced as an error, per spec.md §7.
    pub fn recv(&mut self, datagram: &[u8], now: Instant) -> Vec<DeliveredMessage> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        let header = match PacketHeader::decode_expecting(datagram, self.direction_remote) {
            Ok(h) => h,
            Err(err) => {
                self.note_drop(DropReason::from(err));
                return Vec::new();
            }
        };

        match self.remote_history.insert(header.seq) {
            InsertResult::Duplicate => {
                self.note_drop(DropReason::Duplicate);
                return Vec::new();
            }
            InsertResult::TooOld => {
                self.note_drop(DropReason::TooOld);
                return Vec::new();
            }
            InsertResult::Accepted => {}
        }

        let header_bytes = header.to_bytes();
        let ciphertext = &datagram[header_bytes.len()..];
        let body = match self.session_key.open(&header.nonce(), &header_bytes, ciphertext) {
            Ok(b) => b,
            Err(_) => {
                self.note_drop(DropReason::DecryptFailed);
                return Vec::new();
            }
        };

        self.last_recv_time = now;
        self.stats.record_received(datagram.len(), header.count as u64);

        self.process_acks(header.ack, header.ack_bits, now);

        if header.pkt_type == PacketType::Disconnect {
            self.state = ConnectionState::Disconnected(DisconnectReason::Remote);
            return Vec::new();
        }
        if header.pkt_type == PacketType::KeepAlive {
            return Vec::new();
        }

        let slots = match packet::unpack(Bytes::from(body), header.count, header.pkt_type) {
            Ok(s) => s,
            Err(_) => {
                self.note_drop(DropReason::MalformedBody);
                return Vec::new();
            }
        };

        let mut delivered = Vec::new();
        for slot in slots {
            match slot.kind {
                PacketType::App => {
                    if self.mark_delivered(slot.msg_seq) {
                        delivered.push(DeliveredMessage {
                            msg_seq: slot.msg_seq,
                            payload: slot.payload.to_vec(),
                        });
                    }
                }
                PacketType::AppFragment => {
                    let Ok(fragment) = Fragment::decode(&slot.payload) else {
                        self.note_drop(DropReason::MalformedBody);
                        continue;
                    };
                    if let frag::FeedResult::Complete(bytes) = self.fragments.feed(fragment, now) {
                        if self.mark_delivered(slot.msg_seq) {
                            delivered.push(DeliveredMessage {
                                msg_seq: slot.msg_seq,
                                payload: bytes,
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        delivered
    }

    fn process_acks(&mut self, ack: SeqNum, ack_bits: u32, now: Instant) {
        for packet_seq in BitField::acked_seqs(ack, ack_bits) {
            if self.in_flight.remove(&packet_seq) {
                for message in self.pending.retire_by_packet(packet_seq) {
                    let sample = now.saturating_duration_since(message.first_send_time);
                    self.rtt.update(sample);
                }
            }
        }
    }

    fn mark_delivered(&mut self, msg_seq: SeqNum) -> bool {
        if self.delivered_set.contains(&msg_seq) {
            return false;
        }
        if self.delivered.len() >= DELIVERED_DEDUP_CAP {
            if let Some(oldest) = self.delivered.pop_front() {
                self.delivered_set.remove(&oldest);
            }
        }
        self.delivered.push_back(msg_seq);
        self.delivered_set.insert(msg_seq);
        true
    }

    fn note_drop(&mut self, reason: DropReason) {
        match reason {
            DropReason::DecryptFailed => self.stats.packets_dropped_corrupt += 1,
            DropReason::Duplicate | DropReason::TooOld => self.stats.packets_dropped_stale += 1,
            _ => {}
        }
        tracing::debug!(?reason, "dropped inbound packet");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(now: Instant) -> (Connection, Connection) {
        let key_bytes = [1u8; 32];
        let client = Connection::established(
            true,
            SessionKey::new(key_bytes),
            packet::DEFAULT_MTU,
            Duration::from_millis(50),
            Duration::from_secs(5),
            Duration::from_millis(25),
            now,
        );
        let server = Connection::established(
            false,
            SessionKey::new(key_bytes),
            packet::DEFAULT_MTU,
            Duration::from_millis(50),
            Duration::from_secs(5),
            Duration::from_millis(25),
            now,
        );
        (client, server)
    }

    #[test]
    fn simple_message_round_trip() {
        let now = Instant::now();
        let (mut client, mut server) = pair(now);

        client.send(b"hello", RetryMode::BestEffort);
        let datagrams = client.flush(now);
        assert_eq!(datagrams.len(), 1);

        let delivered = server.recv(&datagrams[0], now);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, b"hello");
    }

    #[test]
    fn ack_retires_pending_message_and_updates_rtt() {
        let now = Instant::now();
        let (mut client, mut server) = pair(now);

        client.send(b"hi", RetryMode::RetryOnTimeout);
        let datagrams = client.flush(now);
        server.recv(&datagrams[0], now);

        let later = now + Duration::from_millis(20);
        let server_datagrams = server.flush(later);
        assert!(!server_datagrams.is_empty());

        let after_ack = later + Duration::from_millis(5);
        client.recv(&server_datagrams[0], after_ack);
        assert!(client.rtt().is_some());
    }

    #[test]
    fn duplicate_packet_is_dropped() {
        let now = Instant::now();
        let (mut client, mut server) = pair(now);
        client.send(b"x", RetryMode::None);
        let datagrams = client.flush(now);

        let first = server.recv(&datagrams[0], now);
        let second = server.recv(&datagrams[0], now);
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(server.stats().packets_dropped_stale, 1);
    }

    #[test]
    fn large_message_is_fragmented_and_reassembled() {
        let now = Instant::now();
        let (mut client, mut server) = pair(now);
        let payload = vec![7u8; FRAGMENT_CHUNK_LEN * 3 + 10];
        client.send(&payload, RetryMode::BestEffort);

        let mut delivered = Vec::new();
        let mut current = now;
        loop {
            let datagrams = client.flush(current);
            if datagrams.is_empty() {
                break;
            }
            for datagram in datagrams {
                delivered.extend(server.recv(&datagram, current));
            }
            current += Duration::from_millis(1);
        }

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, payload);
    }

    #[test]
    fn disconnect_moves_to_terminal_state() {
        let now = Instant::now();
        let (mut client, mut server) = pair(now);
        client.disconnect();
        let datagrams = client.flush(now);
        assert_eq!(datagrams.len(), 1);
        assert!(matches!(
            client.state(),
            ConnectionState::Disconnected(DisconnectReason::Local)
        ));

        server.recv(&datagrams[0], now);
        assert!(matches!(
            server.state(),
            ConnectionState::Disconnected(DisconnectReason::Remote)
        ));
    }

    #[test]
    fn connection_times_out_without_traffic() {
        let now = Instant::now();
        let (mut client, _server) = pair(now);
        let later = now + Duration::from_secs(10);
        client.update(later);
        assert!(matches!(
            client.state(),
            ConnectionState::Dropped(DisconnectReason::Timeout)
        ));
    }
}
